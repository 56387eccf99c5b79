// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use quiver_codec::{Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#17.2
//# In QUIC version 1, this value MUST NOT exceed 20.  Endpoints that
//# receive a version 1 long header with a value larger than 20 MUST drop
//# the packet.

pub const MAX_LEN: usize = 20;

/// The length of connection IDs this endpoint issues for itself
pub const LOCAL_LEN: usize = 8;

#[derive(Clone, Copy, Debug)]
pub struct Error;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "connection id exceeds 20 bytes")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// A peer- or locally-chosen connection identifier, at most 20 bytes
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct ConnectionId {
    bytes: [u8; MAX_LEN],
    len: u8,
}

impl ConnectionId {
    pub const EMPTY: Self = Self {
        bytes: [0; MAX_LEN],
        len: 0,
    };

    #[inline]
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() > MAX_LEN {
            return Err(Error);
        }
        let mut bytes = [0; MAX_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Self {
            bytes,
            len: slice.len() as u8,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }
}

impl AsRef<[u8]> for ConnectionId {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x")?;
        for byte in self.as_slice() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl TryFrom<&[u8]> for ConnectionId {
    type Error = Error;

    #[inline]
    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Self::try_from_slice(slice)
    }
}

/// Encodes the bare id bytes, without a length prefix. Long headers
/// prefix the length themselves; short headers carry no length at all.
impl EncoderValue for ConnectionId {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(self.as_slice());
    }
}

/// A locally issued connection id, always [`LOCAL_LEN`] bytes
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct LocalId([u8; LOCAL_LEN]);

impl LocalId {
    #[inline]
    pub fn new(bytes: [u8; LOCAL_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn try_from_slice(slice: &[u8]) -> Option<Self> {
        Some(Self(slice.try_into().ok()?))
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<LocalId> for ConnectionId {
    #[inline]
    fn from(id: LocalId) -> Self {
        ConnectionId::try_from_slice(id.as_slice()).expect("local ids fit in 20 bytes")
    }
}

/// A client-chosen Initial DCID extended with the peer's socket address
///
/// First Initial packets from different clients may carry equal DCIDs.
/// The address suffix keeps their registry entries distinct.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ExtendedId {
    cid: ConnectionId,
    addr: std::net::SocketAddr,
}

impl ExtendedId {
    #[inline]
    pub fn new(cid: ConnectionId, addr: std::net::SocketAddr) -> Self {
        Self { cid, addr }
    }

    #[inline]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.cid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_bounds() {
        assert!(ConnectionId::try_from_slice(&[0; 20]).is_ok());
        assert!(ConnectionId::try_from_slice(&[0; 21]).is_err());
        assert!(ConnectionId::try_from_slice(&[]).unwrap().is_empty());
    }

    #[test]
    fn extended_ids_distinguish_peers() {
        let cid = ConnectionId::try_from_slice(&[1, 2, 3]).unwrap();
        let a = ExtendedId::new(cid, "10.0.0.1:4433".parse().unwrap());
        let b = ExtendedId::new(cid, "10.0.0.2:4433".parse().unwrap());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
