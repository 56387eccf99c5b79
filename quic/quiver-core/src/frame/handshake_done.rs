// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::HANDSHAKE_DONE_TAG;
use quiver_codec::{Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#19.20
//# The server uses the HANDSHAKE_DONE frame (type=0x1e) to signal
//# confirmation of the handshake to the client.

#[derive(Debug, PartialEq, Eq)]
pub struct HandshakeDone;

impl EncoderValue for HandshakeDone {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&HANDSHAKE_DONE_TAG);
    }
}
