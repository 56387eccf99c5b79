// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The packet builder: frame serialization, packet assembly, AEAD seal
//! and header protection
//!
//! Builders commit whole packets into the writer buffer of the output
//! ring. The packet number advances only after a packet is committed.

use crate::{
    crypto_stream::CRYPTO_IN_FLIGHT_MAX,
    level::{EncLevel, TxCryptoFrame},
    ring_buf::TxBuf,
    space::PacketNumberSpace,
};
use quiver_core::{
    connection::{id::LOCAL_LEN, ConnectionId},
    crypto::apply_header_protection,
    endpoint,
    frame::{
        Ack, ConnectionClose, Crypto, HandshakeDone, NewConnectionId, Padding, Ping, Stream,
    },
    packet::{
        encode_long_header, encode_short_header, PacketType, INITIAL_PACKET_MIN_LEN, TAG_LEN,
    },
    transport::Error,
    varint::VarInt,
};
use quiver_codec::{Encoder, EncoderBuffer, EncoderValue};
use tracing::trace;

/// Builder outcome, the caller's dispatch contract:
/// a committed packet, nothing to send, or a full buffer to rotate away
/// from. Fatal conditions (encryption failure) surface as `Err`.
#[derive(Debug, Eq, PartialEq)]
pub enum Built {
    Committed { len: usize, crypto_len: usize },
    Empty,
    Full,
}

/// Connection-scoped inputs every build needs
pub struct BuilderCtx<'a> {
    pub version: u32,
    pub dcid: &'a ConnectionId,
    pub scid: &'a ConnectionId,
    pub endpoint: endpoint::Type,
}

/// A control frame queued by the connection for the next 1-RTT packet
#[derive(Debug)]
pub enum OwnedFrame {
    Ping,
    HandshakeDone,
    NewConnectionId {
        sequence: u64,
        cid: [u8; LOCAL_LEN],
        token: [u8; 16],
    },
    ConnectionClose {
        code: VarInt,
        frame_type: Option<VarInt>,
        reason: &'static str,
    },
    Stream {
        id: u64,
        offset: u64,
        data: Vec<u8>,
        fin: bool,
    },
}

impl OwnedFrame {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        match self {
            Self::Ping => encoder.encode(&Ping),
            Self::HandshakeDone => encoder.encode(&HandshakeDone),
            Self::NewConnectionId { sequence, cid, token } => encoder.encode(&NewConnectionId {
                sequence_number: VarInt::new(*sequence).unwrap_or(VarInt::ZERO),
                retire_prior_to: VarInt::ZERO,
                connection_id: cid,
                stateless_reset_token: token,
            }),
            Self::ConnectionClose { code, frame_type, reason } => {
                encoder.encode(&ConnectionClose {
                    error_code: *code,
                    frame_type: *frame_type,
                    reason: reason.as_bytes(),
                })
            }
            Self::Stream { id, offset, data, fin } => encoder.encode(&Stream {
                stream_id: VarInt::new(*id).unwrap_or(VarInt::ZERO),
                offset: VarInt::new(*offset).unwrap_or(VarInt::ZERO),
                data,
                is_fin: *fin,
                is_last_frame: false,
            }),
        }
    }

    fn encoding_size(&self) -> usize {
        let mut counter = quiver_codec::LenCounter::default();
        self.encode(&mut counter);
        counter.len()
    }
}

/// The ACK frame to include, when the space requires one and has ranges
fn pending_ack(space: &PacketNumberSpace) -> Option<Ack> {
    if space.ack_required() {
        Ack::from_ranges(&space.ack_ranges)
    } else {
        None
    }
}

// The header protection sample starts 4 bytes past the packet number
// field, so short packets need padding for the mask to be computable.
fn sample_padding(payload_len: usize, pn_len: usize) -> usize {
    (4 - pn_len).saturating_sub(payload_len)
}

/// Builds one long-header packet carrying CRYPTO data from `offset`
/// (`avail` bytes available there) plus a pending ACK
///
/// On commit the consumed CRYPTO range is recorded in the level's sent
/// tree and counted against the in-flight cap.
#[allow(clippy::too_many_arguments)]
pub fn build_handshake_packet(
    buf: &mut TxBuf,
    ctx: &BuilderCtx<'_>,
    packet_type: PacketType,
    level: &mut EncLevel,
    space: &mut PacketNumberSpace,
    offset: u64,
    avail: usize,
    crypto_in_flight: &mut usize,
) -> Result<Built, Error> {
    // never put more than the per-connection CRYPTO budget in flight
    let cap = CRYPTO_IN_FLIGHT_MAX.saturating_sub(*crypto_in_flight);
    let avail = avail.min(cap);

    let ack = pending_ack(space);
    if avail == 0 && ack.is_none() {
        return Ok(Built::Empty);
    }

    let truncated = space
        .truncate_next_pn()
        .ok_or(Error::INTERNAL_ERROR.with_reason("packet number space exhausted"))?;
    let pn = space.next_pn();
    let pn_len = truncated.len().bytesize();

    let token_fields_len = if packet_type == PacketType::Initial { 1 } else { 0 };
    let header_len = 1 + 4 + 1 + ctx.dcid.len() + 1 + ctx.scid.len() + token_fields_len;
    let ack_len = ack.as_ref().map(EncoderValue::encoding_size).unwrap_or(0);
    // worst case for the Length field of a <=1252 byte packet
    let length_field_len = 2;

    let fixed = header_len + length_field_len + pn_len + ack_len + TAG_LEN;
    if fixed + 16 > buf.room() {
        return Ok(Built::Full);
    }

    let offset_varint =
        VarInt::new(offset).map_err(|_| Error::INTERNAL_ERROR.with_reason("offset overflow"))?;
    let crypto_len = if avail > 0 {
        Crypto::max_payload(offset_varint, (buf.room() - fixed).min(avail + 8)).min(avail)
    } else {
        0
    };
    let crypto_frame_len = if crypto_len > 0 {
        Crypto::header_size(offset_varint, crypto_len) + crypto_len
    } else {
        0
    };

    if avail > 0 && crypto_len == 0 && ack.is_none() {
        // no room left for any payload in this buffer
        return Ok(Built::Full);
    }

    // frames that land in the protected payload
    let mut payload_len = ack_len + crypto_frame_len;
    let mut padding = sample_padding(payload_len, pn_len);

    //= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#14
    //# A client MUST expand the payload of all UDP datagrams carrying
    //# Initial packets to at least 1200 bytes
    if ctx.endpoint.is_client() && packet_type == PacketType::Initial {
        let total = header_len + length_field_len + pn_len + payload_len + padding + TAG_LEN;
        if total < INITIAL_PACKET_MIN_LEN {
            padding += INITIAL_PACKET_MIN_LEN - total;
        }
    }
    payload_len += padding;

    let length_value = pn_len + payload_len + TAG_LEN;
    let total = header_len
        + VarInt::new(length_value as u64)
            .map_err(|_| Error::INTERNAL_ERROR)?
            .encoding_size()
            .max(length_field_len)
        + pn_len
        + payload_len
        + TAG_LEN;
    if total > buf.room() {
        return Ok(Built::Full);
    }

    // clear-text assembly
    let room = buf.room();
    let mut encoder = EncoderBuffer::new(&mut buf.space()[..room]);
    encode_long_header(
        &mut encoder,
        packet_type,
        ctx.version,
        ctx.dcid,
        ctx.scid,
        truncated.len(),
    );
    if packet_type == PacketType::Initial {
        // servers never send a token
        encoder.encode(&VarInt::ZERO);
    }
    encode_fixed_len_varint(&mut encoder, length_value as u64, length_field_len);

    let pn_offset = encoder.len();
    encoder.encode(&truncated);

    if let Some(ack) = &ack {
        encoder.encode(ack);
    }
    if crypto_len > 0 {
        let chunk = level.tx_crypto.chunk_at(offset);
        encoder.encode(&Crypto {
            offset: offset_varint,
            data: &chunk[..crypto_len],
        });
    }
    if padding > 0 {
        encoder.encode(&Padding { length: padding });
    }

    let end = encoder.len();
    debug_assert_eq!(end, pn_offset + pn_len + payload_len);

    seal_and_commit(buf, level, pn, pn_offset, pn_len, end)?;

    // bookkeeping only after the packet is committed
    space.consume_pn();
    if ack.is_some() {
        space.clear_ack_required();
    }
    if crypto_len > 0 {
        level.sent.insert(
            pn,
            TxCryptoFrame {
                offset,
                len: crypto_len,
            },
        );
        *crypto_in_flight += crypto_len;
    }

    trace!(pn, ?packet_type, crypto_len, total, "handshake packet built");
    Ok(Built::Committed { len: total, crypto_len })
}

/// Builds one short-header packet from the connection's control-frame
/// queue plus a pending ACK
///
/// Frames are consumed greedily while they fit; the remainder stays
/// queued for the next buffer.
pub fn build_app_packet(
    buf: &mut TxBuf,
    ctx: &BuilderCtx<'_>,
    level: &mut EncLevel,
    space: &mut PacketNumberSpace,
    frames: &mut std::collections::VecDeque<OwnedFrame>,
) -> Result<Built, Error> {
    let ack = pending_ack(space);
    if frames.is_empty() && ack.is_none() {
        return Ok(Built::Empty);
    }

    let truncated = space
        .truncate_next_pn()
        .ok_or(Error::INTERNAL_ERROR.with_reason("packet number space exhausted"))?;
    let pn = space.next_pn();
    let pn_len = truncated.len().bytesize();

    let header_len = 1 + ctx.dcid.len();
    let ack_len = ack.as_ref().map(EncoderValue::encoding_size).unwrap_or(0);
    let fixed = header_len + pn_len + ack_len + TAG_LEN + 4;
    if fixed > buf.room() {
        return Ok(Built::Full);
    }

    // take as many queued frames as fit
    let mut budget = buf.room() - header_len - pn_len - ack_len - TAG_LEN;
    let mut taken = Vec::new();
    while let Some(frame) = frames.front() {
        let size = frame.encoding_size();
        if size > budget {
            break;
        }
        budget -= size;
        taken.push(frames.pop_front().expect("front checked"));
    }

    if taken.is_empty() && ack.is_none() {
        // the first frame alone does not fit this buffer
        return Ok(Built::Full);
    }

    let room = buf.room();
    let mut encoder = EncoderBuffer::new(&mut buf.space()[..room]);
    encode_short_header(&mut encoder, ctx.dcid, truncated.len());

    let pn_offset = encoder.len();
    encoder.encode(&truncated);

    if let Some(ack) = &ack {
        encoder.encode(ack);
    }
    for frame in &taken {
        frame.encode(&mut encoder);
    }

    let payload_len = encoder.len() - pn_offset - pn_len;
    let padding = sample_padding(payload_len, pn_len);
    if padding > 0 {
        encoder.encode(&Padding { length: padding });
    }

    let end = encoder.len();
    seal_and_commit(buf, level, pn, pn_offset, pn_len, end)?;

    space.consume_pn();
    if ack.is_some() {
        space.clear_ack_required();
    }

    let total = end + TAG_LEN;
    trace!(pn, frames = taken.len(), total, "application packet built");
    Ok(Built::Committed { len: total, crypto_len: 0 })
}

/// Encrypts `[pn_offset + pn_len, end)` in place, appends the tag,
/// applies header protection and commits the packet to `buf`
fn seal_and_commit(
    buf: &mut TxBuf,
    level: &EncLevel,
    pn: u64,
    pn_offset: usize,
    pn_len: usize,
    end: usize,
) -> Result<(), Error> {
    let keys = level
        .keys
        .tx()
        .ok_or(Error::INTERNAL_ERROR.with_reason("tx keys not installed"))?;

    let packet = buf.space();
    let (aad, payload) = packet.split_at_mut(pn_offset + pn_len);
    let payload = &mut payload[..end - pn_offset - pn_len];
    let tag = keys.seal(pn, aad, payload)?;
    packet[end..end + TAG_LEN].copy_from_slice(&tag);

    let pn_len = match pn_len {
        1 => quiver_core::packet::number::PacketNumberLen::U8,
        2 => quiver_core::packet::number::PacketNumberLen::U16,
        3 => quiver_core::packet::number::PacketNumberLen::U24,
        _ => quiver_core::packet::number::PacketNumberLen::U32,
    };
    apply_header_protection(keys, &mut packet[..end + TAG_LEN], pn_offset, pn_len)?;

    buf.commit(end + TAG_LEN);
    Ok(())
}

/// Writes a varint using exactly `len` bytes (1, 2, 4 or 8)
///
/// Packet length fields are reserved before the payload size is final,
/// so they cannot use the minimal encoding.
fn encode_fixed_len_varint<E: Encoder>(encoder: &mut E, value: u64, len: usize) {
    match len {
        1 => encoder.encode(&(value as u8)),
        2 => encoder.encode(&(value as u16 | 0x4000)),
        4 => encoder.encode(&(value as u32 | 0x8000_0000)),
        _ => encoder.encode(&(value | 0xc000_0000_0000_0000)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::crypto::CipherSuite;

    fn test_level() -> EncLevel {
        let mut level = EncLevel::new();
        level
            .keys
            .install_tx(CipherSuite::Aes128GcmSha256, &[9; 32])
            .unwrap();
        level
            .keys
            .install_rx(CipherSuite::Aes128GcmSha256, &[9; 32])
            .unwrap();
        level
    }

    fn ctx<'a>(
        dcid: &'a ConnectionId,
        scid: &'a ConnectionId,
        endpoint: endpoint::Type,
    ) -> BuilderCtx<'a> {
        BuilderCtx {
            version: quiver_core::QUIC_VERSION,
            dcid,
            scid,
            endpoint,
        }
    }

    #[test]
    fn server_initial_packet_with_crypto() {
        let mut buf = crate::ring_buf::TxBufferRing::new(2);
        let mut level = test_level();
        let mut space = PacketNumberSpace::new();
        let mut in_flight = 0;

        level.tx_crypto.append(b"ServerHello ......");
        let dcid = ConnectionId::try_from_slice(&[1; 8]).unwrap();
        let scid = ConnectionId::try_from_slice(&[2; 8]).unwrap();
        let ctx = ctx(&dcid, &scid, endpoint::Type::Server);

        let avail = level.tx_crypto.pending() as usize;
        let built = build_handshake_packet(
            buf.wbuf(),
            &ctx,
            PacketType::Initial,
            &mut level,
            &mut space,
            0,
            avail,
            &mut in_flight,
        )
        .unwrap();

        let Built::Committed { len: total, crypto_len } = built else {
            panic!("expected a committed packet, got {built:?}");
        };
        assert_eq!(crypto_len, 18);
        // servers do not pad Initials to 1200
        assert!(total < 100);
        assert_eq!(space.next_pn(), 1);
        assert_eq!(in_flight, 18);
        assert_eq!(level.sent.get(&0).unwrap().len, 18);

        // the packet must parse and decrypt back
        let (header, consumed) =
            quiver_core::packet::ProtectedHeader::parse(buf.wbuf().contents(), 8).unwrap();
        assert_eq!(consumed, total);
        assert_eq!(header.packet_type, PacketType::Initial);

        let mut packet = crate::rx::RxPacket::from_header(header, buf.wbuf().contents()).unwrap();
        level.remove_header_protection(&mut packet, None).unwrap();
        assert_eq!(packet.pn, 0);
        level.decrypt_packet(&mut packet).unwrap();

        let payload = &packet.data[packet.aad_len..packet.len];
        let (frame, _) =
            quiver_core::frame::Frame::decode(quiver_codec::DecoderBuffer::new(payload)).unwrap();
        match frame {
            quiver_core::frame::Frame::Crypto(crypto) => {
                assert_eq!(crypto.data, b"ServerHello ......");
                assert_eq!(crypto.offset.as_u64(), 0);
            }
            other => panic!("expected CRYPTO, got {other:?}"),
        }
    }

    #[test]
    fn client_initial_is_padded_to_1200() {
        let mut buf = crate::ring_buf::TxBufferRing::new(2);
        let mut level = test_level();
        let mut space = PacketNumberSpace::new();
        let mut in_flight = 0;

        level.tx_crypto.append(b"ClientHello");
        let dcid = ConnectionId::try_from_slice(&[1; 8]).unwrap();
        let scid = ConnectionId::try_from_slice(&[2; 8]).unwrap();
        let ctx = ctx(&dcid, &scid, endpoint::Type::Client);

        let built = build_handshake_packet(
            buf.wbuf(),
            &ctx,
            PacketType::Initial,
            &mut level,
            &mut space,
            0,
            11,
            &mut in_flight,
        )
        .unwrap();
        assert_eq!(
            built,
            Built::Committed {
                len: INITIAL_PACKET_MIN_LEN,
                crypto_len: 11
            }
        );
    }

    #[test]
    fn in_flight_cap_blocks_crypto() {
        let mut buf = crate::ring_buf::TxBufferRing::new(2);
        let mut level = test_level();
        let mut space = PacketNumberSpace::new();
        let mut in_flight = CRYPTO_IN_FLIGHT_MAX;

        level.tx_crypto.append(b"blocked");
        let dcid = ConnectionId::try_from_slice(&[1; 8]).unwrap();
        let scid = ConnectionId::try_from_slice(&[2; 8]).unwrap();
        let ctx = ctx(&dcid, &scid, endpoint::Type::Server);

        let built = build_handshake_packet(
            buf.wbuf(),
            &ctx,
            PacketType::Handshake,
            &mut level,
            &mut space,
            0,
            7,
            &mut in_flight,
        )
        .unwrap();
        assert_eq!(built, Built::Empty);
        assert_eq!(space.next_pn(), 0);
    }

    #[test]
    fn ack_only_packet_clears_flag() {
        let mut buf = crate::ring_buf::TxBufferRing::new(2);
        let mut level = test_level();
        let mut space = PacketNumberSpace::new();
        let mut in_flight = 0;

        space.on_rx_packet(0, true);
        space.on_rx_packet(1, true);
        assert!(space.ack_required());

        let dcid = ConnectionId::try_from_slice(&[1; 8]).unwrap();
        let scid = ConnectionId::try_from_slice(&[2; 8]).unwrap();
        let ctx = ctx(&dcid, &scid, endpoint::Type::Server);

        let built = build_handshake_packet(
            buf.wbuf(),
            &ctx,
            PacketType::Initial,
            &mut level,
            &mut space,
            0,
            0,
            &mut in_flight,
        )
        .unwrap();
        assert!(matches!(built, Built::Committed { crypto_len: 0, .. }));
        assert!(!space.ack_required());
        assert_eq!(in_flight, 0);
        assert!(level.sent.is_empty());
    }

    #[test]
    fn app_packet_with_control_frames() {
        let mut buf = crate::ring_buf::TxBufferRing::new(2);
        let mut level = test_level();
        let mut space = PacketNumberSpace::new();

        let dcid = ConnectionId::try_from_slice(&[3; 8]).unwrap();
        let scid = ConnectionId::try_from_slice(&[4; 8]).unwrap();
        let ctx = ctx(&dcid, &scid, endpoint::Type::Server);

        let mut frames = std::collections::VecDeque::new();
        frames.push_back(OwnedFrame::HandshakeDone);
        frames.push_back(OwnedFrame::NewConnectionId {
            sequence: 1,
            cid: [7; 8],
            token: [8; 16],
        });

        let built = build_app_packet(buf.wbuf(), &ctx, &mut level, &mut space, &mut frames).unwrap();
        assert!(matches!(built, Built::Committed { .. }));
        assert!(frames.is_empty());

        // decrypt and check both frames are present
        let (header, _) =
            quiver_core::packet::ProtectedHeader::parse(buf.wbuf().contents(), 8).unwrap();
        assert!(!header.long_header);
        let mut packet = crate::rx::RxPacket::from_header(header, buf.wbuf().contents()).unwrap();
        level.remove_header_protection(&mut packet, None).unwrap();
        level.decrypt_packet(&mut packet).unwrap();

        let mut payload = quiver_codec::DecoderBuffer::new(&packet.data[packet.aad_len..packet.len]);
        let mut kinds = Vec::new();
        while !payload.is_empty() {
            let (frame, rest) = quiver_core::frame::Frame::decode(payload).unwrap();
            kinds.push(std::mem::discriminant(&frame));
            let _ = frame;
            payload = rest;
        }
        assert_eq!(kinds.len(), 2);
    }

    #[test]
    fn full_buffer_reports_full() {
        let mut buf = crate::ring_buf::TxBufferRing::new(2);
        // fill the writer buffer almost completely
        let fill = buf.wbuf().room() - 10;
        buf.wbuf().commit(fill);

        let mut level = test_level();
        let mut space = PacketNumberSpace::new();
        let mut in_flight = 0;
        level.tx_crypto.append(b"data");

        let dcid = ConnectionId::try_from_slice(&[1; 8]).unwrap();
        let scid = ConnectionId::try_from_slice(&[2; 8]).unwrap();
        let ctx = ctx(&dcid, &scid, endpoint::Type::Server);

        let built = build_handshake_packet(
            buf.wbuf(),
            &ctx,
            PacketType::Initial,
            &mut level,
            &mut space,
            0,
            4,
            &mut in_flight,
        )
        .unwrap();
        assert_eq!(built, Built::Full);
        assert_eq!(space.next_pn(), 0);
    }
}
