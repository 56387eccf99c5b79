// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet header parsing and construction
//!
//! Parsing stops at the packet number: the caller owns header-protection
//! removal (the pn length is not knowable before the mask is computed) and
//! payload decryption. See [`crate::crypto`] for both.

use crate::{
    connection::id::{self, ConnectionId},
    packet::number::PacketNumberLen,
    varint::VarInt,
};
use quiver_codec::{DecoderBuffer, DecoderError, Encoder};

pub mod number;

pub const FIXED_BIT: u8 = 0x40;
pub const LONG_HEADER_BIT: u8 = 0x80;
const TYPE_SHIFT: usize = 4;
const TYPE_MASK: u8 = 0b11;

/// The AEAD tag appended to every protected packet
pub const TAG_LEN: usize = 16;

/// Offset from the packet number field to the header-protection sample
pub const PN_MAX_LEN: usize = 4;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#14
//# A client MUST expand the payload of all UDP datagrams carrying
//# Initial packets to at least 1200 bytes
pub const INITIAL_PACKET_MIN_LEN: usize = 1200;

/// Long-header packet types, bits 4-5 of the first byte
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl PacketType {
    #[inline]
    pub fn from_tag(tag: u8) -> Self {
        match (tag >> TYPE_SHIFT) & TYPE_MASK {
            0b00 => Self::Initial,
            0b01 => Self::ZeroRtt,
            0b10 => Self::Handshake,
            _ => Self::Retry,
        }
    }

    #[inline]
    pub fn tag_bits(self) -> u8 {
        let bits = match self {
            Self::Initial => 0b00,
            Self::ZeroRtt => 0b01,
            Self::Handshake => 0b10,
            Self::Retry => 0b11,
        };
        bits << TYPE_SHIFT
    }
}

/// Why a received packet was discarded without further processing
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DropReason {
    /// The fixed bit was zero
    FixedBitZero,
    /// A connection id length field exceeded 20 bytes
    ConnectionIdTooLong,
    /// A non-Initial long header carried a DCID that cannot be ours
    ForeignConnectionId,
    /// The length field overflowed the datagram
    TruncatedPacket,
    /// Version 0: a Version Negotiation packet (responder out of scope)
    VersionNegotiation,
    /// Retry packets are not processed (responder out of scope)
    Retry,
}

impl From<DecoderError> for DropReason {
    #[inline]
    fn from(_: DecoderError) -> Self {
        Self::TruncatedPacket
    }
}

/// An invariant packet header, parsed up to (not including) the
/// protected packet number
#[derive(Debug)]
pub struct ProtectedHeader {
    pub long_header: bool,
    pub packet_type: PacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub token_len: usize,
    /// Offset of the packet number field from the start of the packet
    pub pn_offset: usize,
    /// Total packet length, header included, once the pn field starts
    pub packet_len: usize,
}

impl ProtectedHeader {
    /// Parses one packet header out of `buffer` (the remaining datagram).
    ///
    /// Returns the header and the offset one past this packet, where a
    /// coalesced packet may follow.
    pub fn parse(buffer: &[u8], local_cid_len: usize) -> Result<(Self, usize), DropReason> {
        let decoder = DecoderBuffer::new(buffer);
        let (first, decoder) = decoder.decode::<u8>()?;

        //= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#17.2
        //# Fixed Bit:  The next bit (0x40) of byte 0 is set to 1.  Packets
        //#    containing a zero value for this bit are not valid packets in this
        //#    version and MUST be dropped.
        if first & FIXED_BIT == 0 {
            return Err(DropReason::FixedBitZero);
        }

        if first & LONG_HEADER_BIT != 0 {
            Self::parse_long(first, buffer, decoder, local_cid_len)
        } else {
            Self::parse_short(buffer, decoder, local_cid_len)
        }
    }

    fn parse_long(
        first: u8,
        packet: &[u8],
        decoder: DecoderBuffer<'_>,
        local_cid_len: usize,
    ) -> Result<(Self, usize), DropReason> {
        let packet_type = PacketType::from_tag(first);

        let (version, decoder) = decoder.decode::<u32>()?;
        if version == 0 {
            return Err(DropReason::VersionNegotiation);
        }
        if packet_type == PacketType::Retry {
            return Err(DropReason::Retry);
        }

        let (dcid_len, decoder) = decoder.decode::<u8>()?;
        if usize::from(dcid_len) > id::MAX_LEN {
            return Err(DropReason::ConnectionIdTooLong);
        }
        if packet_type != PacketType::Initial && usize::from(dcid_len) != local_cid_len {
            return Err(DropReason::ForeignConnectionId);
        }
        let (dcid, decoder) = decoder.decode_slice(dcid_len.into())?;
        let dcid = ConnectionId::try_from_slice(dcid).expect("length checked above");

        let (scid_len, decoder) = decoder.decode::<u8>()?;
        if usize::from(scid_len) > id::MAX_LEN {
            return Err(DropReason::ConnectionIdTooLong);
        }
        let (scid, decoder) = decoder.decode_slice(scid_len.into())?;
        let scid = ConnectionId::try_from_slice(scid).expect("length checked above");

        let (token_len, decoder) = if packet_type == PacketType::Initial {
            let (token_len, decoder) = decoder.decode::<VarInt>()?;
            let token_len: usize = token_len
                .try_into()
                .map_err(|_| DropReason::TruncatedPacket)?;
            let decoder = decoder.skip(token_len)?;
            (token_len, decoder)
        } else {
            (0, decoder)
        };

        let (payload_len, decoder) = decoder.decode::<VarInt>()?;
        let payload_len: usize = payload_len
            .try_into()
            .map_err(|_| DropReason::TruncatedPacket)?;
        decoder.ensure_len(payload_len)?;

        let pn_offset = packet.len() - decoder.len();
        let packet_len = pn_offset + payload_len;

        Ok((
            Self {
                long_header: true,
                packet_type,
                version,
                dcid,
                scid,
                token_len,
                pn_offset,
                packet_len,
            },
            packet_len,
        ))
    }

    fn parse_short(
        packet: &[u8],
        decoder: DecoderBuffer<'_>,
        local_cid_len: usize,
    ) -> Result<(Self, usize), DropReason> {
        let (dcid, _decoder) = decoder.decode_slice(local_cid_len)?;
        let dcid = ConnectionId::try_from_slice(dcid).expect("local cid fits");

        // A short-header packet extends to the end of the datagram.
        let pn_offset = 1 + local_cid_len;
        let packet_len = packet.len();

        Ok((
            Self {
                long_header: false,
                packet_type: PacketType::Initial, // unused for short headers
                version: 0,
                dcid,
                scid: ConnectionId::EMPTY,
                token_len: 0,
                pn_offset,
                packet_len,
            },
            packet_len,
        ))
    }
}

/// Writes a long header up to (not including) the Length field
///
/// The first byte carries the truncated packet number length, which must
/// be known before the header is written.
#[inline]
pub fn encode_long_header<E: Encoder>(
    encoder: &mut E,
    packet_type: PacketType,
    version: u32,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    pn_len: PacketNumberLen,
) {
    let tag = FIXED_BIT | LONG_HEADER_BIT | packet_type.tag_bits() | pn_len.packet_tag();
    encoder.encode(&tag);
    encoder.encode(&version);
    encoder.encode(&(dcid.len() as u8));
    encoder.encode(dcid);
    encoder.encode(&(scid.len() as u8));
    encoder.encode(scid);
}

/// Writes a short header: flags then the bare DCID
#[inline]
pub fn encode_short_header<E: Encoder>(
    encoder: &mut E,
    dcid: &ConnectionId,
    pn_len: PacketNumberLen,
) {
    let tag = FIXED_BIT | pn_len.packet_tag();
    encoder.encode(&tag);
    encoder.encode(dcid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_codec::EncoderBuffer;

    fn build_initial(dcid: &[u8], scid: &[u8], payload_len: usize) -> Vec<u8> {
        let mut data = vec![0u8; 64 + payload_len];
        let mut encoder = EncoderBuffer::new(&mut data);
        let dcid = ConnectionId::try_from_slice(dcid).unwrap();
        let scid = ConnectionId::try_from_slice(scid).unwrap();
        encode_long_header(
            &mut encoder,
            PacketType::Initial,
            crate::QUIC_VERSION,
            &dcid,
            &scid,
            PacketNumberLen::U16,
        );
        encoder.encode(&VarInt::ZERO); // token length
        encoder.encode(&VarInt::new(payload_len as u64).unwrap());
        let len = encoder.len() + payload_len;
        data.truncate(len);
        data
    }

    #[test]
    fn parse_initial_header() {
        let packet = build_initial(&[1, 2, 3, 4], &[5, 6, 7, 8, 9, 10, 11, 12], 32);
        let (header, consumed) = ProtectedHeader::parse(&packet, 8).unwrap();
        assert!(header.long_header);
        assert_eq!(header.packet_type, PacketType::Initial);
        assert_eq!(header.version, crate::QUIC_VERSION);
        assert_eq!(header.dcid.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(header.scid.as_slice(), &[5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(header.token_len, 0);
        assert_eq!(consumed, packet.len());
        assert_eq!(header.pn_offset + 32, packet.len());
    }

    #[test]
    fn fixed_bit_must_be_set() {
        let mut packet = build_initial(&[1], &[2], 8);
        packet[0] &= !FIXED_BIT;
        assert_eq!(
            ProtectedHeader::parse(&packet, 8).unwrap_err(),
            DropReason::FixedBitZero
        );
    }

    #[test]
    fn oversized_dcid_is_dropped() {
        // hand-build: 21-byte dcid length field
        let mut packet = vec![FIXED_BIT | LONG_HEADER_BIT, 0xff, 0, 0, 0x1c, 21];
        packet.extend_from_slice(&[0; 32]);
        assert_eq!(
            ProtectedHeader::parse(&packet, 8).unwrap_err(),
            DropReason::ConnectionIdTooLong
        );
    }

    #[test]
    fn length_overflowing_datagram_is_dropped() {
        let mut packet = build_initial(&[1, 2, 3, 4], &[5, 6, 7, 8], 32);
        packet.truncate(packet.len() - 8);
        assert_eq!(
            ProtectedHeader::parse(&packet, 8).unwrap_err(),
            DropReason::TruncatedPacket
        );
    }

    #[test]
    fn short_header_spans_datagram() {
        let mut packet = vec![FIXED_BIT | 0b01];
        packet.extend_from_slice(&[9; 8]); // dcid
        packet.extend_from_slice(&[0; 20]); // pn + payload
        let (header, consumed) = ProtectedHeader::parse(&packet, 8).unwrap();
        assert!(!header.long_header);
        assert_eq!(header.dcid.as_slice(), &[9; 8]);
        assert_eq!(header.pn_offset, 9);
        assert_eq!(consumed, packet.len());
    }

    #[test]
    fn version_negotiation_is_dropped() {
        let mut packet = vec![FIXED_BIT | LONG_HEADER_BIT, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0; 8]);
        assert_eq!(
            ProtectedHeader::parse(&packet, 8).unwrap_err(),
            DropReason::VersionNegotiation
        );
    }
}
