// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Tag, CONNECTION_CLOSE_APP_TAG, CONNECTION_CLOSE_TAG},
    varint::VarInt,
};
use quiver_codec::{DecoderBuffer, DecoderBufferResult, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#19.19
//# An endpoint sends a CONNECTION_CLOSE frame (type=0x1c or 0x1d) to
//# notify its peer that the connection is being closed.  The
//# CONNECTION_CLOSE with a frame type of 0x1c is used to signal errors
//# at only the QUIC layer, or the absence of errors (with the NO_ERROR
//# code).  The CONNECTION_CLOSE frame with a type of 0x1d is used to
//# signal an error with the application that uses QUIC.

#[derive(Debug, PartialEq, Eq)]
pub struct ConnectionClose<'a> {
    pub error_code: VarInt,
    /// Set for the transport variant (0x1c): the frame type that
    /// triggered the error, 0 when unknown. `None` marks the
    /// application variant (0x1d).
    pub frame_type: Option<VarInt>,
    pub reason: &'a [u8],
}

impl<'a> ConnectionClose<'a> {
    #[inline]
    pub fn tag(&self) -> Tag {
        if self.frame_type.is_some() {
            CONNECTION_CLOSE_TAG
        } else {
            CONNECTION_CLOSE_APP_TAG
        }
    }

    pub(crate) fn decode_after_tag(
        tag: Tag,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        let (error_code, buffer) = buffer.decode::<VarInt>()?;
        let (frame_type, buffer) = if tag == CONNECTION_CLOSE_TAG {
            let (frame_type, buffer) = buffer.decode::<VarInt>()?;
            (Some(frame_type), buffer)
        } else {
            (None, buffer)
        };
        let (reason, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
        Ok((
            Self {
                error_code,
                frame_type,
                reason,
            },
            buffer,
        ))
    }
}

impl EncoderValue for ConnectionClose<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());
        encoder.encode(&self.error_code);
        if let Some(frame_type) = self.frame_type {
            encoder.encode(&frame_type);
        }
        encoder.encode_with_len_prefix::<VarInt, _>(&self.reason);
    }
}
