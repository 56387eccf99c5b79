// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{ack::AckRanges, frame::ACK_TAG, varint::VarInt};
use quiver_codec::{decoder_value, DecoderError, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#19.3
//# Receivers send ACK frames (types 0x02 and 0x03) to inform senders of
//# packets they have received and processed.

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#19.3
//# ACK Frame {
//#   Type (i) = 0x02..0x03,
//#   Largest Acknowledged (i),
//#   ACK Delay (i),
//#   ACK Range Count (i),
//#   First ACK Range (i),
//#   ACK Range (..) ...,
//# }

/// A decoded ACK frame, expanded to inclusive `(largest, smallest)`
/// ranges in descending order
#[derive(Debug, PartialEq, Eq)]
pub struct Ack {
    pub largest: VarInt,
    /// Raw ACK Delay field; scale by `2^ack_delay_exponent` to get
    /// microseconds
    pub delay: VarInt,
    ranges: Vec<(u64, u64)>,
}

impl Ack {
    /// Builds an ACK reflecting the received ranges with a zero delay
    ///
    /// Returns `None` when nothing has been received yet.
    pub fn from_ranges(ranges: &AckRanges) -> Option<Self> {
        let largest = ranges.largest()?;
        Some(Self {
            largest: VarInt::new(largest).ok()?,
            delay: VarInt::ZERO,
            ranges: ranges.iter_descending().map(|(f, l)| (l, f)).collect(),
        })
    }

    /// Iterates inclusive `(largest, smallest)` pairs, descending
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().copied()
    }

    #[inline]
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }
}

decoder_value!(
    impl<'a> Ack {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (largest, buffer) = buffer.decode::<VarInt>()?;
            let (delay, buffer) = buffer.decode::<VarInt>()?;
            let (range_count, buffer) = buffer.decode::<VarInt>()?;
            let (first_range, buffer) = buffer.decode::<VarInt>()?;

            let mut smallest = largest
                .as_u64()
                .checked_sub(first_range.as_u64())
                .ok_or(DecoderError::InvariantViolation("first ack range too large"))?;

            let mut ranges = Vec::with_capacity(range_count.as_u64().min(64) as usize + 1);
            ranges.push((largest.as_u64(), smallest));

            let mut buffer = buffer;
            for _ in 0..range_count.as_u64() {
                let (gap, rest) = buffer.decode::<VarInt>()?;
                let (len, rest) = rest.decode::<VarInt>()?;
                buffer = rest;

                //= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#19.3.1
                //# If any computed packet number is negative, an endpoint MUST
                //# generate a connection error of type FRAME_ENCODING_ERROR.
                let next_largest = smallest
                    .checked_sub(gap.as_u64())
                    .and_then(|v| v.checked_sub(2))
                    .ok_or(DecoderError::InvariantViolation("ack gap underflow"))?;
                smallest = next_largest
                    .checked_sub(len.as_u64())
                    .ok_or(DecoderError::InvariantViolation("ack range underflow"))?;
                ranges.push((next_largest, smallest));
            }

            Ok((Ack { largest, delay, ranges }, buffer))
        }
    }
);

impl EncoderValue for Ack {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&ACK_TAG);
        encoder.encode(&self.largest);
        encoder.encode(&self.delay);
        encoder.encode(&VarInt::new(self.ranges.len() as u64 - 1).unwrap_or(VarInt::ZERO));

        let (largest, smallest) = self.ranges[0];
        encoder.encode(&VarInt::new(largest - smallest).expect("range fits"));

        let mut prev_smallest = smallest;
        for (largest, smallest) in self.ranges.iter().skip(1) {
            let gap = prev_smallest - largest - 2;
            encoder.encode(&VarInt::new(gap).expect("gap fits"));
            encoder.encode(&VarInt::new(largest - smallest).expect("range fits"));
            prev_smallest = *smallest;
        }
    }
}
