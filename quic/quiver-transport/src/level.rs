// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{crypto_stream::CryptoTxStream, rx::RxPacket};
use quiver_core::crypto::{self, LevelKeys};
use std::collections::{BTreeMap, VecDeque};

/// An outgoing CRYPTO frame, indexed by the packet number it left in
///
/// One frame per packet. When the packet is acknowledged the descriptor
/// is dropped; when it is declared lost the descriptor moves to the
/// retransmit tree (coalesced with its gap neighbors).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxCryptoFrame {
    pub offset: u64,
    pub len: usize,
}

/// Per-encryption-level state
#[derive(Debug, Default)]
pub struct EncLevel {
    pub keys: LevelKeys,
    /// Packets whose header protection is not yet removable
    pub rx_pending: VecDeque<RxPacket>,
    /// Unprotected packets keyed by packet number, awaiting decryption,
    /// dispatch or in-order CRYPTO delivery
    pub rx_packets: BTreeMap<u64, RxPacket>,
    /// Next in-order CRYPTO offset to hand to the TLS provider
    pub rx_crypto_offset: u64,
    /// Outbound CRYPTO bytes from the TLS provider
    pub tx_crypto: CryptoTxStream,
    /// Sent CRYPTO frames by packet number
    pub sent: BTreeMap<u64, TxCryptoFrame>,
    /// Lost CRYPTO frames scheduled for retransmission, by original pn
    pub retransmit: BTreeMap<u64, TxCryptoFrame>,
}

impl EncLevel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unprotects `packet` and fills in its pn fields
    ///
    /// `largest_rx_pn` is the space's largest seen packet number, used
    /// for truncated-pn expansion.
    pub fn remove_header_protection(
        &self,
        packet: &mut RxPacket,
        largest_rx_pn: Option<u64>,
    ) -> Result<(), crypto::Error> {
        let keys = self.keys.rx().ok_or(crypto::Error::DECRYPT_ERROR)?;
        let truncated =
            crypto::remove_header_protection(keys, &mut packet.data, packet.pn_offset)?;

        use quiver_core::{packet::number::PacketNumber, varint::VarInt};
        let largest = PacketNumber::from_varint(
            VarInt::new(largest_rx_pn.unwrap_or(0)).map_err(|_| crypto::Error::DECRYPT_ERROR)?,
        );
        packet.pn = truncated.expand(largest).as_u64();
        packet.pn_len = truncated.len().bytesize();
        // the AAD covers the header up to and including the pn
        packet.aad_len = packet.pn_offset + packet.pn_len;
        Ok(())
    }

    /// Decrypts `packet` in place; on success `packet.len` shrinks to
    /// the header plus plaintext
    pub fn decrypt_packet(&self, packet: &mut RxPacket) -> Result<(), crypto::Error> {
        let keys = self.keys.rx().ok_or(crypto::Error::DECRYPT_ERROR)?;
        let (aad, payload) = packet.data.split_at_mut(packet.aad_len);
        let payload = &mut payload[..packet.len - packet.aad_len];
        let plaintext_len = keys.open(packet.pn, aad, payload)?;
        packet.len = packet.aad_len + plaintext_len;
        Ok(())
    }

    /// True when nothing remains to transmit for this level
    #[inline]
    pub fn tx_idle(&self) -> bool {
        self.tx_crypto.is_consumed() && self.retransmit.is_empty()
    }
}
