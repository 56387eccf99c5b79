// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Tag, STREAM_TAG_BASE},
    varint::VarInt,
};
use quiver_codec::{DecoderBuffer, DecoderBufferResult, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#19.8
//# STREAM frames implicitly create a stream and carry stream data.  The
//# STREAM frame takes the form 0b00001XXX (or the set of values from
//# 0x08 to 0x0f).  The value of the three low-order bits of the frame
//# type determines the fields that are present in the frame.

const OFF_BIT: Tag = 0x04;
const LEN_BIT: Tag = 0x02;
const FIN_BIT: Tag = 0x01;

#[derive(Debug, PartialEq, Eq)]
pub struct Stream<'a> {
    pub stream_id: VarInt,
    pub offset: VarInt,
    pub data: &'a [u8],
    pub is_fin: bool,
    /// When set, no Length field is written and the frame extends to the
    /// end of the packet
    pub is_last_frame: bool,
}

impl<'a> Stream<'a> {
    #[inline]
    pub fn tag(&self) -> Tag {
        let mut tag = STREAM_TAG_BASE;
        if self.offset != VarInt::ZERO {
            tag |= OFF_BIT;
        }
        if !self.is_last_frame {
            tag |= LEN_BIT;
        }
        if self.is_fin {
            tag |= FIN_BIT;
        }
        tag
    }

    pub(crate) fn decode_after_tag(
        tag: Tag,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        let (stream_id, buffer) = buffer.decode::<VarInt>()?;

        let (offset, buffer) = if tag & OFF_BIT != 0 {
            buffer.decode::<VarInt>()?
        } else {
            (VarInt::ZERO, buffer)
        };

        let (data, is_last_frame, buffer) = if tag & LEN_BIT != 0 {
            let (data, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
            (data, false, buffer)
        } else {
            let (data, buffer) = buffer.decode::<&[u8]>()?;
            (data, true, buffer)
        };

        Ok((
            Self {
                stream_id,
                offset,
                data,
                is_fin: tag & FIN_BIT != 0,
                is_last_frame,
            },
            buffer,
        ))
    }
}

impl EncoderValue for Stream<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let tag = self.tag();
        encoder.encode(&tag);
        encoder.encode(&self.stream_id);
        if tag & OFF_BIT != 0 {
            encoder.encode(&self.offset);
        }
        if tag & LEN_BIT != 0 {
            encoder.encode_with_len_prefix::<VarInt, _>(&self.data);
        } else {
            encoder.write_slice(self.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_codec::EncoderBuffer;

    fn round_trip(frame: Stream) {
        let mut data = [0u8; 128];
        let mut encoder = EncoderBuffer::new(&mut data);
        encoder.encode(&frame);
        let len = encoder.len();

        let tag = data[0];
        let (decoded, rest) =
            Stream::decode_after_tag(tag, DecoderBuffer::new(&data[1..len])).unwrap();
        if frame.is_last_frame {
            assert!(rest.is_empty());
        }
        assert_eq!(decoded, frame);
    }

    #[test]
    fn bit_variants() {
        for is_fin in [false, true] {
            for is_last_frame in [false, true] {
                for offset in [VarInt::ZERO, VarInt::from_u16(777)] {
                    round_trip(Stream {
                        stream_id: VarInt::from_u8(5),
                        offset,
                        data: b"stream payload",
                        is_fin,
                        is_last_frame,
                    });
                }
            }
        }
    }
}
