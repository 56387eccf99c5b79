// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! ACK processing for outgoing CRYPTO frames: acknowledged frames are
//! released, frames falling in the gaps between ACK ranges are declared
//! lost, coalesced, and queued for retransmission.

use crate::{
    level::{EncLevel, TxCryptoFrame},
    space::PacketNumberSpace,
};
use quiver_core::{frame::Ack, transport::Error};
use tracing::trace;

/// Outcome of processing one ACK frame against a level
#[derive(Debug, Default, Eq, PartialEq)]
pub struct AckOutcome {
    /// Bytes of CRYPTO data released from the in-flight counter
    pub freed_in_flight: usize,
    /// A lost frame was queued; the connection must set its retransmit
    /// flag and wake the tasklet
    pub lost_frames: bool,
}

/// Releases every sent frame whose pn lies in `[smallest, largest]`
fn release_range(level: &mut EncLevel, largest: u64, smallest: u64, freed: &mut usize) {
    let acked: Vec<u64> = level
        .sent
        .range(smallest..=largest)
        .map(|(pn, _)| *pn)
        .collect();
    for pn in acked {
        if let Some(frame) = level.sent.remove(&pn) {
            trace!(pn, offset = frame.offset, len = frame.len, "crypto frame acked");
            *freed += frame.len;
        }
    }
}

/// Coalesces the frames lost in `(gap_end, gap_start)` (both exclusive)
/// into a single descriptor on the retransmit tree
///
/// Consecutive outgoing CRYPTO frames were contiguous on the wire, so
/// their byte ranges merge by summing lengths onto the earliest frame.
fn collect_gap(level: &mut EncLevel, gap_start: u64, gap_end: u64, freed: &mut usize) -> bool {
    let lost: Vec<u64> = level
        .sent
        .range(gap_end.saturating_add(1)..gap_start)
        .map(|(pn, _)| *pn)
        .collect();
    let Some(&first_pn) = lost.first() else {
        return false;
    };

    let mut merged = level.sent.remove(&first_pn).expect("pn from range walk");
    for pn in &lost[1..] {
        let frame = level.sent.remove(pn).expect("pn from range walk");
        debug_assert_eq!(merged.offset + merged.len as u64, frame.offset);
        merged.len += frame.len;
    }
    *freed += merged.len;

    trace!(
        pn = first_pn,
        offset = merged.offset,
        len = merged.len,
        "crypto frames lost, queued for retransmit"
    );
    level.retransmit.insert(first_pn, merged);
    true
}

/// Walks an ACK frame's ranges against the level's sent-frame tree
///
//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#13.1
//# An endpoint SHOULD treat receipt of an acknowledgment for a packet it
//# did not send as a connection error of type PROTOCOL_VIOLATION, if it
//# is able to detect the condition.
pub fn on_ack_received(
    level: &mut EncLevel,
    space: &mut PacketNumberSpace,
    ack: &Ack,
) -> Result<AckOutcome, Error> {
    if ack.largest.as_u64() >= space.next_pn() {
        return Err(Error::PROTOCOL_VIOLATION.with_reason("ack for unsent packet"));
    }

    let mut outcome = AckOutcome::default();
    let mut ranges = ack.iter().peekable();
    while let Some((largest, smallest)) = ranges.next() {
        release_range(level, largest, smallest, &mut outcome.freed_in_flight);

        if let Some(&(next_largest, _)) = ranges.peek() {
            if collect_gap(level, smallest, next_largest, &mut outcome.freed_in_flight) {
                outcome.lost_frames = true;
            }
        }
    }

    space.on_largest_acked(ack.largest.as_u64());
    Ok(outcome)
}

/// A retransmitted prefix was rebuilt into a new packet: shrink or
/// drop the tree entry
pub fn consume_retransmit(level: &mut EncLevel, pn: u64, sent_len: usize) {
    if let Some(frame) = level.retransmit.get_mut(&pn) {
        if sent_len >= frame.len {
            level.retransmit.remove(&pn);
        } else {
            frame.offset += sent_len as u64;
            frame.len -= sent_len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::ack::AckRanges;

    fn level_with_frames(frames: &[(u64, u64, usize)]) -> EncLevel {
        let mut level = EncLevel::new();
        for (pn, offset, len) in frames {
            level.sent.insert(
                *pn,
                TxCryptoFrame {
                    offset: *offset,
                    len: *len,
                },
            );
        }
        level
    }

    fn ack_of(pns: &[u64], space: &mut PacketNumberSpace) -> Ack {
        let mut ranges = AckRanges::new();
        for pn in pns {
            ranges.insert(*pn);
        }
        while space.next_pn() <= *pns.iter().max().unwrap() {
            space.consume_pn();
        }
        Ack::from_ranges(&ranges).unwrap()
    }

    /// spec scenario 3: pns {5,6,7,8} sent, peer acks 5-6 and 8
    #[test]
    fn gap_triggers_retransmit() {
        let mut level =
            level_with_frames(&[(5, 0, 100), (6, 100, 100), (7, 200, 100), (8, 300, 100)]);
        let mut space = PacketNumberSpace::new();
        let ack = ack_of(&[5, 6, 8], &mut space);

        let outcome = on_ack_received(&mut level, &mut space, &ack).unwrap();
        assert!(outcome.lost_frames);
        assert_eq!(outcome.freed_in_flight, 400);
        assert!(level.sent.is_empty());

        let (pn, frame) = level.retransmit.iter().next().unwrap();
        assert_eq!(*pn, 7);
        assert_eq!(frame, &TxCryptoFrame { offset: 200, len: 100 });
        assert_eq!(space.largest_acked_pn(), Some(8));
    }

    #[test]
    fn adjacent_lost_frames_coalesce() {
        let mut level = level_with_frames(&[
            (1, 0, 50),
            (2, 50, 70),
            (3, 120, 30),
            (4, 150, 10),
        ]);
        let mut space = PacketNumberSpace::new();
        // only 1 and 4 acked: 2 and 3 share the gap
        let ack = ack_of(&[1, 4], &mut space);

        let outcome = on_ack_received(&mut level, &mut space, &ack).unwrap();
        assert!(outcome.lost_frames);
        assert_eq!(level.retransmit.len(), 1);
        let frame = level.retransmit.get(&2).unwrap();
        assert_eq!(frame, &TxCryptoFrame { offset: 50, len: 100 });
        assert_eq!(outcome.freed_in_flight, 50 + 10 + 100);
    }

    #[test]
    fn ack_beyond_next_pn_is_a_connection_error() {
        let mut level = level_with_frames(&[]);
        let mut space = PacketNumberSpace::new();
        let mut ranges = AckRanges::new();
        ranges.insert(9);
        let ack = Ack::from_ranges(&ranges).unwrap();
        // nothing sent: next_pn is 0
        assert!(on_ack_received(&mut level, &mut space, &ack).is_err());
    }

    #[test]
    fn duplicate_ack_is_idempotent() {
        let mut level = level_with_frames(&[(0, 0, 10)]);
        let mut space = PacketNumberSpace::new();
        let ack = ack_of(&[0], &mut space);

        let first = on_ack_received(&mut level, &mut space, &ack).unwrap();
        assert_eq!(first.freed_in_flight, 10);
        let second = on_ack_received(&mut level, &mut space, &ack).unwrap();
        assert_eq!(second, AckOutcome::default());
    }

    #[test]
    fn consume_retransmit_keeps_remainder() {
        let mut level = level_with_frames(&[]);
        level.retransmit.insert(7, TxCryptoFrame { offset: 200, len: 100 });

        consume_retransmit(&mut level, 7, 60);
        assert_eq!(
            level.retransmit.get(&7),
            Some(&TxCryptoFrame { offset: 260, len: 40 })
        );
        consume_retransmit(&mut level, 7, 40);
        assert!(level.retransmit.is_empty());
    }
}
