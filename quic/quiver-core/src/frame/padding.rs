// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::PADDING_TAG;
use quiver_codec::{DecoderBuffer, DecoderBufferResult, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#19.1
//# The PADDING frame (type=0x00) has no semantic value.  PADDING frames
//# can be used to increase the size of a packet.

/// A run of zero bytes
#[derive(Debug, PartialEq, Eq)]
pub struct Padding {
    pub length: usize,
}

impl Padding {
    /// Greedily consumes every consecutive padding byte
    pub(crate) fn decode_after_tag(
        buffer: DecoderBuffer<'_>,
    ) -> DecoderBufferResult<'_, Self> {
        let mut length = 1;
        let mut buffer = buffer;
        while buffer.peek_byte(0) == Ok(PADDING_TAG) {
            buffer = buffer.skip(1)?;
            length += 1;
        }
        Ok((Self { length }, buffer))
    }
}

impl EncoderValue for Padding {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_repeated(self.length, PADDING_TAG);
    }
}
