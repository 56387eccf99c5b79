// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use quiver_codec::{DecoderBuffer, DecoderBufferResult, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#12.3
//# The packet number is an integer in the range 0 to 2^62-1.  This
//# number is used in determining the cryptographic nonce for packet
//# protection.  Each endpoint maintains a separate packet number for
//# sending and receiving.

/// A full 62-bit packet number
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PacketNumber(VarInt);

impl PacketNumber {
    pub const ZERO: Self = Self(VarInt::ZERO);

    #[inline]
    pub const fn from_varint(value: VarInt) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    pub const fn as_varint(self) -> VarInt {
        self.0
    }

    #[inline]
    pub fn next(self) -> Option<Self> {
        Some(Self(self.0.checked_add(VarInt::from_u8(1))?))
    }

    //= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#17.1
    //# The sender MUST use a packet number size able to represent more than
    //# twice as large a range than the difference between the largest
    //# acknowledged packet and packet number being sent.
    #[inline]
    pub fn truncate(self, largest_acked: Option<PacketNumber>) -> Option<TruncatedPacketNumber> {
        let range = match largest_acked {
            Some(acked) => self.as_u64().checked_sub(acked.as_u64())?,
            // Nothing acknowledged yet: the receiver expects pn 0, so the
            // whole value must be representable.
            None => self.as_u64().checked_add(1)?,
        };
        let range = range.checked_mul(2)?;
        let len = PacketNumberLen::for_range(range)?;
        Some(TruncatedPacketNumber {
            value: (self.as_u64() & len.mask()) as u32,
            len,
        })
    }
}

/// The encoded length of a truncated packet number, 1 to 4 bytes
///
/// Carried in the two low bits of the packet's first byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketNumberLen {
    U8,
    U16,
    U24,
    U32,
}

pub(crate) const PACKET_NUMBER_LEN_MASK: u8 = 0b11;

impl PacketNumberLen {
    #[inline]
    pub fn from_packet_tag(tag: u8) -> Self {
        match tag & PACKET_NUMBER_LEN_MASK {
            0b00 => Self::U8,
            0b01 => Self::U16,
            0b10 => Self::U24,
            _ => Self::U32,
        }
    }

    #[inline]
    pub fn packet_tag(self) -> u8 {
        self.bytesize() as u8 - 1
    }

    #[inline]
    pub fn bytesize(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U24 => 3,
            Self::U32 => 4,
        }
    }

    #[inline]
    pub fn bitsize(self) -> usize {
        self.bytesize() * 8
    }

    #[inline]
    fn mask(self) -> u64 {
        (1u64 << self.bitsize()) - 1
    }

    #[inline]
    fn for_range(range: u64) -> Option<Self> {
        match range {
            0..=0xff => Some(Self::U8),
            0x100..=0xffff => Some(Self::U16),
            0x1_0000..=0xff_ffff => Some(Self::U24),
            0x100_0000..=0xffff_ffff => Some(Self::U32),
            _ => None,
        }
    }
}

/// A packet number reduced to its low 8..32 bits for transmission
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TruncatedPacketNumber {
    value: u32,
    len: PacketNumberLen,
}

impl TruncatedPacketNumber {
    #[inline]
    pub fn new(value: u32, len: PacketNumberLen) -> Self {
        debug_assert!(u64::from(value) <= len.mask());
        Self { value, len }
    }

    #[inline]
    pub fn into_u64(self) -> u64 {
        self.value as u64
    }

    #[inline]
    pub fn len(self) -> PacketNumberLen {
        self.len
    }

    #[inline]
    pub fn decode(
        buffer: DecoderBuffer<'_>,
        len: PacketNumberLen,
    ) -> DecoderBufferResult<'_, Self> {
        let (bytes, buffer) = buffer.decode_slice(len.bytesize())?;
        let mut value = 0u32;
        for byte in bytes {
            value = (value << 8) | u32::from(*byte);
        }
        Ok((Self { value, len }, buffer))
    }

    //= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#A
    //# DecodePacketNumber(largest_pn, truncated_pn, pn_nbits):
    //#    expected_pn  = largest_pn + 1
    //#    pn_win       = 1 << pn_nbits
    //#    pn_hwin      = pn_win / 2
    //#    pn_mask      = pn_win - 1
    //#    candidate_pn = (expected_pn & ~pn_mask) | truncated_pn
    //#    if candidate_pn <= expected_pn - pn_hwin and
    //#       candidate_pn < (1 << 62) - pn_win:
    //#       return candidate_pn + pn_win
    //#    if candidate_pn > expected_pn + pn_hwin and
    //#       candidate_pn >= pn_win:
    //#       return candidate_pn - pn_win
    //#    return candidate_pn
    #[inline]
    pub fn expand(self, largest_pn: PacketNumber) -> PacketNumber {
        let expected_pn = largest_pn.as_u64() + 1;
        let pn_win = 1u64 << self.len.bitsize();
        let pn_hwin = pn_win / 2;
        let pn_mask = pn_win - 1;

        let candidate_pn = (expected_pn & !pn_mask) | self.into_u64();

        let candidate_pn = if candidate_pn.checked_add(pn_hwin).map_or(false, |v| v <= expected_pn)
            && candidate_pn < (1u64 << 62) - pn_win
        {
            candidate_pn + pn_win
        } else if candidate_pn > expected_pn.saturating_add(pn_hwin) && candidate_pn >= pn_win {
            candidate_pn - pn_win
        } else {
            candidate_pn
        };

        let candidate_pn = candidate_pn.min(crate::varint::MAX_VARINT_VALUE);
        PacketNumber::from_varint(VarInt::new(candidate_pn).expect("clamped above"))
    }
}

impl EncoderValue for TruncatedPacketNumber {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let bytes = self.value.to_be_bytes();
        encoder.write_slice(&bytes[4 - self.len.bytesize()..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::check;

    fn pn(value: u64) -> PacketNumber {
        PacketNumber::from_varint(VarInt::new(value).unwrap())
    }

    #[test]
    fn truncate_expand_round_trip() {
        check!()
            .with_type::<(u64, u64)>()
            .cloned()
            .for_each(|(largest, expected)| {
                let largest = pn(largest & crate::varint::MAX_VARINT_VALUE);
                let expected = pn(expected & crate::varint::MAX_VARINT_VALUE);
                if let Some(truncated) = expected.truncate(Some(largest)) {
                    assert_eq!(expected, truncated.expand(largest));
                }
            });
    }

    //= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#17.1
    //= type=test
    //# For example, if the highest successfully
    //# authenticated packet had a packet number of 0xa82f30ea, then a packet
    //# containing a 16-bit value of 0x9b32 will be decoded as 0xa82f9b32.
    #[test]
    fn rfc_expansion_example() {
        let largest = pn(0xa82f_30ea);
        let truncated = TruncatedPacketNumber::new(0x9b32, PacketNumberLen::U16);
        assert_eq!(truncated.expand(largest), pn(0xa82f_9b32));
    }

    #[test]
    fn expansion_crosses_window() {
        // spec scenario: largest_acked 0xaaf0, truncated 0x01, 8 bits
        let largest = pn(0xaaf0);
        let truncated = TruncatedPacketNumber::new(0x01, PacketNumberLen::U8);
        assert_eq!(truncated.expand(largest), pn(0xab01));
    }

    #[test]
    fn truncation_length_examples() {
        // from the transport draft: acked 0xabe8bc
        let largest_acked = Some(pn(0x00ab_e8bc));
        assert_eq!(
            pn(0x00ac_5c02).truncate(largest_acked).unwrap().len(),
            PacketNumberLen::U16
        );
        assert_eq!(
            pn(0x00ac_e8fe).truncate(largest_acked).unwrap().len(),
            PacketNumberLen::U24
        );
    }

    #[test]
    fn wire_round_trip() {
        use quiver_codec::{DecoderBuffer, EncoderBuffer};

        for len in [
            PacketNumberLen::U8,
            PacketNumberLen::U16,
            PacketNumberLen::U24,
            PacketNumberLen::U32,
        ] {
            let value = (0xdead_beef & len.mask()) as u32;
            let truncated = TruncatedPacketNumber::new(value, len);

            let mut data = [0u8; 4];
            let mut encoder = EncoderBuffer::new(&mut data);
            encoder.encode(&truncated);
            assert_eq!(encoder.len(), len.bytesize());

            let (decoded, _) =
                TruncatedPacketNumber::decode(DecoderBuffer::new(&data[..len.bytesize()]), len)
                    .unwrap();
            assert_eq!(decoded, truncated);
        }
    }
}
