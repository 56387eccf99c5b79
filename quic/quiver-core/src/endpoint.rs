// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// The role of the local endpoint on a connection
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Type {
    /// The connection was accepted by a listener
    Server,
    /// The connection was initiated towards an origin server
    Client,
}

impl Type {
    #[inline]
    pub fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }

    #[inline]
    pub fn is_client(self) -> bool {
        matches!(self, Self::Client)
    }

    /// The role of the peer
    #[inline]
    pub fn peer_type(self) -> Self {
        match self {
            Self::Server => Self::Client,
            Self::Client => Self::Server,
        }
    }
}
