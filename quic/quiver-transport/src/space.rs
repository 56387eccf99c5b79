// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use quiver_core::{
    ack::AckRanges,
    packet::number::{PacketNumber, TruncatedPacketNumber},
    varint::VarInt,
};

/// The three packet-number spaces of a connection
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpaceId {
    Initial,
    Handshake,
    Application,
}

impl SpaceId {
    pub const COUNT: usize = 3;

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Self::Initial => 0,
            Self::Handshake => 1,
            Self::Application => 2,
        }
    }
}

/// One packet-number space: the tx sequence and the rx acknowledgement
/// bookkeeping
///
/// `next_pn` only ever moves forward, and only after a packet has been
/// committed to an output buffer.
#[derive(Debug, Default)]
pub struct PacketNumberSpace {
    next_pn: u64,
    largest_rx_pn: Option<u64>,
    largest_acked_pn: Option<u64>,
    nb_ack_eliciting: u64,
    pub ack_ranges: AckRanges,
    ack_required: bool,
}

impl PacketNumberSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// The packet number the next committed packet will carry
    #[inline]
    pub fn next_pn(&self) -> u64 {
        self.next_pn
    }

    /// Consumes a packet number; called once per committed packet
    #[inline]
    pub fn consume_pn(&mut self) -> u64 {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    /// Truncates `next_pn` for the wire using the peer's ack state
    #[inline]
    pub fn truncate_next_pn(&self) -> Option<TruncatedPacketNumber> {
        let pn = PacketNumber::from_varint(VarInt::new(self.next_pn).ok()?);
        let largest_acked = self
            .largest_acked_pn
            .and_then(|pn| VarInt::new(pn).ok())
            .map(PacketNumber::from_varint);
        pn.truncate(largest_acked)
    }

    #[inline]
    pub fn largest_rx_pn(&self) -> Option<u64> {
        self.largest_rx_pn
    }

    #[inline]
    pub fn largest_acked_pn(&self) -> Option<u64> {
        self.largest_acked_pn
    }

    /// Expands a truncated rx packet number against the largest seen
    #[inline]
    pub fn expand_rx_pn(&self, truncated: TruncatedPacketNumber) -> u64 {
        let largest = PacketNumber::from_varint(
            VarInt::new(self.largest_rx_pn.unwrap_or(0)).unwrap_or(VarInt::ZERO),
        );
        truncated.expand(largest).as_u64()
    }

    /// Records a fully processed rx packet
    ///
    /// Every second ack-eliciting packet arms the ACK_REQUIRED flag, the
    /// cadence the builder answers with an ACK frame.
    pub fn on_rx_packet(&mut self, pn: u64, ack_eliciting: bool) {
        if ack_eliciting {
            self.nb_ack_eliciting += 1;
            if self.nb_ack_eliciting & 1 == 0 {
                self.ack_required = true;
            }
        }
        if self.largest_rx_pn.map_or(true, |largest| pn > largest) {
            self.largest_rx_pn = Some(pn);
        }
        self.ack_ranges.insert(pn);
    }

    pub fn on_largest_acked(&mut self, pn: u64) {
        if self.largest_acked_pn.map_or(true, |largest| pn > largest) {
            self.largest_acked_pn = Some(pn);
        }
    }

    #[inline]
    pub fn ack_required(&self) -> bool {
        self.ack_required
    }

    /// Arms the flag directly; used when an ACK could not be emitted
    #[inline]
    pub fn set_ack_required(&mut self) {
        self.ack_required = true;
    }

    #[inline]
    pub fn clear_ack_required(&mut self) {
        self.ack_required = false;
    }
}
