// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport frame codecs
//!
//! Only the frame types the proxy engine emits or accepts are present;
//! an unrecognized tag is a connection error at the caller's level.

use quiver_codec::{DecoderBuffer, DecoderBufferResult, DecoderError, Encoder, EncoderValue};

pub mod ack;
pub mod connection_close;
pub mod crypto;
pub mod handshake_done;
pub mod new_connection_id;
pub mod padding;
pub mod ping;
pub mod stream;

pub use ack::Ack;
pub use connection_close::ConnectionClose;
pub use crypto::Crypto;
pub use handshake_done::HandshakeDone;
pub use new_connection_id::NewConnectionId;
pub use padding::Padding;
pub use ping::Ping;
pub use stream::Stream;

pub(crate) type Tag = u8;

pub(crate) const PADDING_TAG: Tag = 0x00;
pub(crate) const PING_TAG: Tag = 0x01;
pub(crate) const ACK_TAG: Tag = 0x02;
pub(crate) const CRYPTO_TAG: Tag = 0x06;
pub(crate) const STREAM_TAG_BASE: Tag = 0x08;
pub(crate) const STREAM_TAG_MAX: Tag = 0x0f;
pub(crate) const NEW_CONNECTION_ID_TAG: Tag = 0x18;
pub(crate) const CONNECTION_CLOSE_TAG: Tag = 0x1c;
pub(crate) const CONNECTION_CLOSE_APP_TAG: Tag = 0x1d;
pub(crate) const HANDSHAKE_DONE_TAG: Tag = 0x1e;

/// One parsed frame borrowing its payload from the packet
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Padding(Padding),
    Ping(Ping),
    Ack(Ack),
    Crypto(Crypto<'a>),
    NewConnectionId(NewConnectionId<'a>),
    ConnectionClose(ConnectionClose<'a>),
    HandshakeDone(HandshakeDone),
    Stream(Stream<'a>),
}

impl<'a> Frame<'a> {
    /// Decodes the next frame from a decrypted payload
    pub fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let tag = buffer.peek_byte(0)?;
        let rest = buffer.skip(1)?;

        Ok(match tag {
            PADDING_TAG => {
                let (frame, rest) = Padding::decode_after_tag(rest)?;
                (Frame::Padding(frame), rest)
            }
            PING_TAG => (Frame::Ping(Ping), rest),
            ACK_TAG => {
                let (frame, rest) = rest.decode::<Ack>()?;
                (Frame::Ack(frame), rest)
            }
            CRYPTO_TAG => {
                let (frame, rest) = rest.decode::<Crypto>()?;
                (Frame::Crypto(frame), rest)
            }
            STREAM_TAG_BASE..=STREAM_TAG_MAX => {
                let (frame, rest) = Stream::decode_after_tag(tag, rest)?;
                (Frame::Stream(frame), rest)
            }
            NEW_CONNECTION_ID_TAG => {
                let (frame, rest) = rest.decode::<NewConnectionId>()?;
                (Frame::NewConnectionId(frame), rest)
            }
            CONNECTION_CLOSE_TAG | CONNECTION_CLOSE_APP_TAG => {
                let (frame, rest) = ConnectionClose::decode_after_tag(tag, rest)?;
                (Frame::ConnectionClose(frame), rest)
            }
            HANDSHAKE_DONE_TAG => (Frame::HandshakeDone(HandshakeDone), rest),
            _ => return Err(DecoderError::InvariantViolation("unrecognized frame type")),
        })
    }

    //= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#13.2
    //# Packets containing PADDING, ACK, and CONNECTION_CLOSE frames are not
    //# considered ack-eliciting.
    #[inline]
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding(_) | Frame::Ack(_) | Frame::ConnectionClose(_)
        )
    }
}

impl EncoderValue for Frame<'_> {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        match self {
            Frame::Padding(frame) => encoder.encode(frame),
            Frame::Ping(frame) => encoder.encode(frame),
            Frame::Ack(frame) => encoder.encode(frame),
            Frame::Crypto(frame) => encoder.encode(frame),
            Frame::NewConnectionId(frame) => encoder.encode(frame),
            Frame::ConnectionClose(frame) => encoder.encode(frame),
            Frame::HandshakeDone(frame) => encoder.encode(frame),
            Frame::Stream(frame) => encoder.encode(frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_codec::EncoderBuffer;

    fn round_trip(frame: Frame) {
        let mut data = vec![0u8; 1500];
        let mut encoder = EncoderBuffer::new(&mut data);
        encoder.encode(&frame);
        let len = encoder.len();

        let (decoded, rest) = Frame::decode(DecoderBuffer::new(&data[..len])).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn frame_round_trips() {
        use crate::varint::VarInt;

        round_trip(Frame::Ping(Ping));
        round_trip(Frame::HandshakeDone(HandshakeDone));
        round_trip(Frame::Padding(Padding { length: 37 }));
        round_trip(Frame::Crypto(Crypto {
            offset: VarInt::from_u16(1024),
            data: b"hello",
        }));
        round_trip(Frame::ConnectionClose(ConnectionClose {
            error_code: VarInt::from_u8(0x0a),
            frame_type: Some(VarInt::from_u8(CRYPTO_TAG)),
            reason: b"tls handshake failure",
        }));
        round_trip(Frame::Stream(Stream {
            stream_id: VarInt::from_u8(4),
            offset: VarInt::from_u16(512),
            data: b"body",
            is_fin: true,
            is_last_frame: false,
        }));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let data = [0x42u8, 0, 0];
        assert!(Frame::decode(DecoderBuffer::new(&data)).is_err());
    }

    #[test]
    fn ack_eliciting_classification() {
        assert!(!Frame::Padding(Padding { length: 1 }).is_ack_eliciting());
        assert!(Frame::Ping(Ping).is_ack_eliciting());
        assert!(Frame::Crypto(Crypto {
            offset: crate::varint::VarInt::ZERO,
            data: b"",
        })
        .is_ack_eliciting());
    }
}
