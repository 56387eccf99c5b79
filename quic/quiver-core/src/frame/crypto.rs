// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::CRYPTO_TAG, varint::VarInt};
use quiver_codec::{decoder_value, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#19.6
//# The CRYPTO frame (type=0x06) is used to transmit cryptographic
//# handshake messages.

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#19.6
//# CRYPTO Frame {
//#   Type (i) = 0x06,
//#   Offset (i),
//#   Length (i),
//#   Crypto Data (..),
//# }

#[derive(Debug, PartialEq, Eq)]
pub struct Crypto<'a> {
    /// Byte offset of `data` within the level's CRYPTO stream
    pub offset: VarInt,
    pub data: &'a [u8],
}

impl Crypto<'_> {
    /// Bytes of header (tag, offset, length prefix) a frame carrying
    /// `data_len` payload bytes needs
    #[inline]
    pub fn header_size(offset: VarInt, data_len: usize) -> usize {
        1 + offset.encoding_size()
            + VarInt::try_from(data_len)
                .map(|len| len.encoding_size())
                .unwrap_or(8)
    }

    /// The largest payload that fits a `capacity`-byte budget, including
    /// the frame header
    pub fn max_payload(offset: VarInt, capacity: usize) -> usize {
        let mut payload = capacity.saturating_sub(Self::header_size(offset, capacity));
        // shrinking the payload may shrink its own length prefix; take the
        // largest value that still fits
        while payload > 0 && Self::header_size(offset, payload) + payload > capacity {
            payload -= 1;
        }
        payload
    }
}

decoder_value!(
    impl<'a> Crypto<'a> {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (offset, buffer) = buffer.decode::<VarInt>()?;
            let (data, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
            Ok((Crypto { offset, data }, buffer))
        }
    }
);

impl EncoderValue for Crypto<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&CRYPTO_TAG);
        encoder.encode(&self.offset);
        encoder.encode_with_len_prefix::<VarInt, _>(&self.data);
    }
}
