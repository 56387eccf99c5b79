// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::config::RX_PACKET_MAXLEN;
use quiver_core::{
    connection::ConnectionId,
    packet::{PacketType, ProtectedHeader},
};

/// Location of an in-order CRYPTO chunk within a decrypted packet
#[derive(Clone, Debug)]
pub struct CryptoChunk {
    pub offset: u64,
    pub start: usize,
    pub len: usize,
}

/// A received packet owned by its encryption level until its payload has
/// been consumed
///
/// Allocated on parse; parked on the level's pending list while the rx
/// keys are missing; then keyed by packet number in the level's rx tree;
/// freed once its CRYPTO bytes were delivered in order.
#[derive(Debug)]
pub struct RxPacket {
    pub long_header: bool,
    pub packet_type: PacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub token_len: usize,
    /// Offset of the (still protected) packet number field
    pub pn_offset: usize,
    /// Full packet number; valid once header protection was removed
    pub pn: u64,
    pub pn_len: usize,
    /// Header bytes authenticated as AAD: everything up to and including
    /// the packet number
    pub aad_len: usize,
    /// Total length; shrinks to `aad_len + plaintext` after decryption
    pub len: usize,
    pub data: Vec<u8>,
    pub ack_eliciting: bool,
    /// Frames were already parsed; the packet is only retained for its
    /// out-of-order CRYPTO payload
    pub parsed: bool,
    /// CRYPTO payload arrived ahead of the level's rx offset
    pub out_of_order: bool,
    /// CRYPTO chunks found in the payload, sorted by stream offset
    pub crypto: Vec<CryptoChunk>,
}

/// Why a packet never reached its connection
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RxError {
    /// Header-level drop, see [`quiver_core::packet::DropReason`]
    Malformed,
    /// Larger than the per-packet storage
    TooBig,
    /// No connection matched and the packet cannot create one
    UnknownConnection,
}

impl RxPacket {
    /// Copies one parsed packet out of a datagram
    pub fn from_header(header: ProtectedHeader, packet_bytes: &[u8]) -> Result<Self, RxError> {
        if packet_bytes.len() > RX_PACKET_MAXLEN {
            return Err(RxError::TooBig);
        }
        Ok(Self {
            long_header: header.long_header,
            packet_type: header.packet_type,
            version: header.version,
            dcid: header.dcid,
            scid: header.scid,
            token_len: header.token_len,
            pn_offset: header.pn_offset,
            pn: 0,
            pn_len: 0,
            aad_len: 0,
            len: packet_bytes.len(),
            data: packet_bytes.to_vec(),
            ack_eliciting: false,
            parsed: false,
            out_of_order: false,
            crypto: Vec::new(),
        })
    }
}
