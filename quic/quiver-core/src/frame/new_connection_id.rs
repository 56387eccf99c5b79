// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{connection::id, frame::NEW_CONNECTION_ID_TAG, varint::VarInt};
use quiver_codec::{decoder_value, DecoderError, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#19.15
//# An endpoint sends a NEW_CONNECTION_ID frame (type=0x18) to provide
//# its peer with alternative connection IDs that can be used to break
//# linkability when migrating connections.

pub const STATELESS_RESET_TOKEN_LEN: usize = 16;

#[derive(Debug, PartialEq, Eq)]
pub struct NewConnectionId<'a> {
    pub sequence_number: VarInt,
    pub retire_prior_to: VarInt,
    pub connection_id: &'a [u8],
    pub stateless_reset_token: &'a [u8; STATELESS_RESET_TOKEN_LEN],
}

decoder_value!(
    impl<'a> NewConnectionId<'a> {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (sequence_number, buffer) = buffer.decode::<VarInt>()?;
            let (retire_prior_to, buffer) = buffer.decode::<VarInt>()?;
            if retire_prior_to > sequence_number {
                return Err(DecoderError::InvariantViolation(
                    "retire_prior_to exceeds sequence_number",
                ));
            }
            let (connection_id, buffer) = buffer.decode_slice_with_len_prefix::<u8>()?;
            if connection_id.is_empty() || connection_id.len() > id::MAX_LEN {
                return Err(DecoderError::InvariantViolation("invalid connection id length"));
            }
            let (token, buffer) = buffer.decode_slice(STATELESS_RESET_TOKEN_LEN)?;
            let stateless_reset_token = token.try_into().expect("length checked above");
            Ok((
                NewConnectionId {
                    sequence_number,
                    retire_prior_to,
                    connection_id,
                    stateless_reset_token,
                },
                buffer,
            ))
        }
    }
);

impl EncoderValue for NewConnectionId<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&NEW_CONNECTION_ID_TAG);
        encoder.encode(&self.sequence_number);
        encoder.encode(&self.retire_prior_to);
        encoder.encode(&(self.connection_id.len() as u8));
        encoder.encode(&self.connection_id);
        encoder.write_slice(self.stateless_reset_token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_codec::{DecoderBuffer, EncoderBuffer};

    #[test]
    fn round_trip() {
        let frame = NewConnectionId {
            sequence_number: VarInt::from_u8(1),
            retire_prior_to: VarInt::ZERO,
            connection_id: &[0xab; 8],
            stateless_reset_token: &[0xcd; 16],
        };

        let mut data = [0u8; 64];
        let mut encoder = EncoderBuffer::new(&mut data);
        encoder.encode(&frame);
        let len = encoder.len();

        let (decoded, rest) = DecoderBuffer::new(&data[1..len])
            .decode::<NewConnectionId>()
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn retire_bound_is_enforced() {
        // sequence 0, retire_prior_to 1
        let data = [0u8, 1, 1, 0xff];
        assert!(DecoderBuffer::new(&data).decode::<NewConnectionId>().is_err());
    }
}
