// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use quiver_core::transport::TransportParameters;

/// The number of buffers in the output ring. Must be a power of two.
pub const TX_BUFS_NB: usize = 8;

/// The size of each output buffer, one datagram per buffer
pub const TX_BUF_SZ: usize = 1252;

/// The largest packet the engine stores for a connection
pub const RX_PACKET_MAXLEN: usize = 1252;

/// Immutable per-endpoint configuration, built once per listener or
/// server and threaded through every connection constructor
#[derive(Clone, Debug)]
pub struct Config {
    /// Transport parameters advertised to peers
    pub local_parameters: TransportParameters,
    /// Number of output buffers per connection (power of two)
    pub tx_bufs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_parameters: TransportParameters::default(),
            tx_bufs: TX_BUFS_NB,
        }
    }
}

impl Config {
    pub fn builder() -> Builder {
        Builder(Self::default())
    }
}

#[derive(Debug)]
pub struct Builder(Config);

impl Builder {
    pub fn with_local_parameters(mut self, parameters: TransportParameters) -> Self {
        self.0.local_parameters = parameters;
        self
    }

    pub fn with_tx_bufs(mut self, count: usize) -> Result<Self, &'static str> {
        if !count.is_power_of_two() {
            return Err("tx buffer count must be a power of two");
        }
        self.0.tx_bufs = count;
        Ok(self)
    }

    pub fn build(self) -> Config {
        self.0
    }
}
