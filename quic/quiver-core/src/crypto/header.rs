// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{key::OneWayKeys, Error, SAMPLE_LEN};
use crate::packet::{
    number::{PacketNumberLen, TruncatedPacketNumber},
    LONG_HEADER_BIT, PN_MAX_LEN,
};
use quiver_codec::DecoderBuffer;

//= https://tools.ietf.org/id/draft-ietf-quic-tls-28.txt#5.4.1
//# The output of this algorithm is a 5 byte mask which is applied to the
//# protected header fields using exclusive OR.

pub type HeaderProtectionMask = [u8; 5];

const LONG_HEADER_MASK: u8 = 0x0f;
const SHORT_HEADER_MASK: u8 = 0x1f;

#[inline(always)]
fn first_byte_mask(tag: u8) -> u8 {
    if tag & LONG_HEADER_BIT == LONG_HEADER_BIT {
        LONG_HEADER_MASK
    } else {
        SHORT_HEADER_MASK
    }
}

//= https://tools.ietf.org/id/draft-ietf-quic-tls-28.txt#5.4.2
//# in sampling the packet
//# ciphertext, the Packet Number field is assumed to be 4 bytes long
//# (its maximum possible encoded length).
#[inline]
fn sample<'a>(packet: &'a [u8], pn_offset: usize) -> Result<&'a [u8], Error> {
    packet
        .get(pn_offset + PN_MAX_LEN..pn_offset + PN_MAX_LEN + SAMPLE_LEN)
        .ok_or(Error::HEADER_PROTECTION_ERROR)
}

#[inline]
fn apply_mask(mask: &HeaderProtectionMask, packet: &mut [u8], pn_offset: usize, pn_len: usize) {
    packet[0] ^= mask[0] & first_byte_mask(packet[0]);
    for (pn_byte, mask_byte) in packet[pn_offset..pn_offset + pn_len]
        .iter_mut()
        .zip(&mask[1..])
    {
        *pn_byte ^= mask_byte;
    }
}

/// Protects the first byte and packet number of a sealed packet
///
/// `packet` must already contain the encrypted payload: the mask is
/// sampled from the ciphertext at `pn_offset + 4`.
pub fn apply_header_protection(
    keys: &OneWayKeys,
    packet: &mut [u8],
    pn_offset: usize,
    pn_len: PacketNumberLen,
) -> Result<(), Error> {
    let mask = keys.header_protection_mask(sample(packet, pn_offset)?)?;
    apply_mask(&mask, packet, pn_offset, pn_len.bytesize());
    Ok(())
}

/// Unprotects the first byte and packet number, returning the truncated
/// packet number recovered from the wire
pub fn remove_header_protection(
    keys: &OneWayKeys,
    packet: &mut [u8],
    pn_offset: usize,
) -> Result<TruncatedPacketNumber, Error> {
    let mask = keys.header_protection_mask(sample(packet, pn_offset)?)?;

    packet[0] ^= mask[0] & first_byte_mask(packet[0]);
    // the pn length only becomes readable once byte 0 is unmasked
    let pn_len = PacketNumberLen::from_packet_tag(packet[0]);

    for (pn_byte, mask_byte) in packet[pn_offset..pn_offset + pn_len.bytesize()]
        .iter_mut()
        .zip(&mask[1..])
    {
        *pn_byte ^= mask_byte;
    }

    let (truncated, _) = TruncatedPacketNumber::decode(
        DecoderBuffer::new(&packet[pn_offset..pn_offset + pn_len.bytesize()]),
        pn_len,
    )
    .map_err(|_| Error::HEADER_PROTECTION_ERROR)?;
    Ok(truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::suite::CipherSuite;
    use hex_literal::hex;

    /// Mask application against the quic-tls example exchange
    #[test]
    fn client_initial_mask_example() {
        let mask: HeaderProtectionMask = hex!("1e9cdb9909");
        let unprotected = hex!("c3ff000020088394c8f03e5157080000449e00000002");
        let protected = hex!("cdff000020088394c8f03e5157080000449e9cdb990b");
        // 4-byte packet number at offset 18
        let pn_offset = 18;

        let mut packet = unprotected.to_vec();
        apply_mask(&mask, &mut packet, pn_offset, 4);
        assert_eq!(packet, protected);

        // removal is its own inverse once the pn length is re-read
        packet[0] ^= mask[0] & first_byte_mask(packet[0]);
        let pn_len = PacketNumberLen::from_packet_tag(packet[0]);
        assert_eq!(pn_len.bytesize(), 4);
        packet[0] ^= mask[0] & first_byte_mask(packet[0]);
        apply_mask(&mask, &mut packet, pn_offset, 4);
        assert_eq!(packet, unprotected);
    }

    #[test]
    fn protect_unprotect_round_trip() {
        let keys =
            crate::crypto::key::OneWayKeys::derive(CipherSuite::Aes128GcmSha256, &[3u8; 32])
                .unwrap();

        // short header: flags, 8-byte dcid, 2-byte pn, payload
        let mut packet = vec![crate::packet::FIXED_BIT | 0b01];
        packet.extend_from_slice(&[7; 8]);
        packet.extend_from_slice(&[0x01, 0x02]);
        packet.extend_from_slice(&[0xaa; 24]); // stand-in ciphertext
        let pn_offset = 9;

        let original = packet.clone();
        apply_header_protection(&keys, &mut packet, pn_offset, PacketNumberLen::U16).unwrap();
        assert_ne!(packet, original);

        let truncated = remove_header_protection(&keys, &mut packet, pn_offset).unwrap();
        assert_eq!(packet, original);
        assert_eq!(truncated.len(), PacketNumberLen::U16);
        assert_eq!(truncated.into_u64(), 0x0102);
    }

    #[test]
    fn short_sample_fails() {
        let keys =
            crate::crypto::key::OneWayKeys::derive(CipherSuite::Aes128GcmSha256, &[3u8; 32])
                .unwrap();
        let mut packet = vec![crate::packet::FIXED_BIT; 12];
        assert_eq!(
            remove_header_protection(&keys, &mut packet, 9).unwrap_err(),
            Error::HEADER_PROTECTION_ERROR
        );
    }
}
