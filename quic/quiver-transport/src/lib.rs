// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection QUIC packet engine
//!
//! Everything here runs inside a single connection tasklet: one owner
//! mutates the connection, its encryption levels, packet-number spaces
//! and buffers. The socket loop hands datagrams to an [`endpoint::Endpoint`],
//! which parses, routes and wakes the owning connection; the connection
//! turn then decrypts, dispatches, builds and queues outgoing datagrams.

pub mod config;
pub mod connection;
pub mod crypto_stream;
pub mod endpoint;
pub mod level;
pub mod recovery;
pub mod ring_buf;
pub mod rx;
pub mod space;
pub mod tasklet;
pub mod tls;
pub mod tx;

pub use config::Config;
pub use connection::Connection;
pub use endpoint::Endpoint;

use quiver_core::packet::PacketType;

/// The four encryption levels of a connection
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EncryptionLevel {
    Initial,
    ZeroRtt,
    Handshake,
    Application,
}

impl EncryptionLevel {
    pub const COUNT: usize = 4;

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Self::Initial => 0,
            Self::ZeroRtt => 1,
            Self::Handshake => 2,
            Self::Application => 3,
        }
    }

    /// The packet-number space this level draws from: 0-RTT and 1-RTT
    /// packets share the Application space
    #[inline]
    pub fn space(self) -> space::SpaceId {
        match self {
            Self::Initial => space::SpaceId::Initial,
            Self::Handshake => space::SpaceId::Handshake,
            Self::ZeroRtt | Self::Application => space::SpaceId::Application,
        }
    }

    /// The level a long-header packet of `packet_type` is protected at
    #[inline]
    pub fn from_packet_type(packet_type: PacketType) -> Option<Self> {
        match packet_type {
            PacketType::Initial => Some(Self::Initial),
            PacketType::ZeroRtt => Some(Self::ZeroRtt),
            PacketType::Handshake => Some(Self::Handshake),
            PacketType::Retry => None,
        }
    }

    /// The long-header packet type for this level, `None` for 1-RTT
    #[inline]
    pub fn packet_type(self) -> Option<PacketType> {
        match self {
            Self::Initial => Some(PacketType::Initial),
            Self::ZeroRtt => Some(PacketType::ZeroRtt),
            Self::Handshake => Some(PacketType::Handshake),
            Self::Application => None,
        }
    }
}
