// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The contract between the packet engine and its TLS provider
//!
//! The provider owns the TLS 1.3 state machine. The engine feeds it
//! in-order CRYPTO bytes per level and turns the provider's outputs
//! (fresh traffic secrets, CRYPTO records, alerts) into key installs and
//! packets. The provider never sees packets.

use crate::EncryptionLevel;
use quiver_core::{crypto::CipherSuite, transport::Error};

/// What `do_handshake` reported for this turn
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakeStatus {
    /// The handshake has completed
    Complete,
    /// The provider needs more peer CRYPTO bytes
    WantRead,
    /// The provider has pending output the engine must flush first
    WantWrite,
}

/// The sink a [`Session`] writes its outputs into while it runs
///
/// Both callbacks may fire from `provide_data` and from `do_handshake`.
pub trait Output {
    /// Fresh traffic secrets for `level`. A `None` direction is not yet
    /// available (e.g. the client's handshake rx secret arrives before
    /// its tx secret is usable).
    fn on_secrets(
        &mut self,
        level: EncryptionLevel,
        suite: CipherSuite,
        rx_secret: Option<&[u8]>,
        tx_secret: Option<&[u8]>,
    ) -> Result<(), Error>;

    /// Handshake bytes to transmit as CRYPTO frames at `level`
    fn emit_crypto(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<(), Error>;

    /// A fatal TLS alert to convey in a CONNECTION_CLOSE
    fn send_alert(&mut self, level: EncryptionLevel, alert: u8);
}

/// A TLS 1.3 session attached to one connection
pub trait Session {
    /// Feeds in-order CRYPTO bytes received at `level`
    fn provide_data(
        &mut self,
        level: EncryptionLevel,
        data: &[u8],
        output: &mut dyn Output,
    ) -> Result<(), Error>;

    /// Drives the handshake forward as far as it can go
    fn do_handshake(&mut self, output: &mut dyn Output) -> Result<HandshakeStatus, Error>;

    /// Installs the local transport parameters blob before the first
    /// flight is produced
    fn set_transport_parameters(&mut self, encoded: &[u8]);

    /// The peer's transport parameters, once the provider has seen them
    fn peer_transport_parameters(&self) -> Option<&[u8]>;
}

pub mod testing {
    //! A scripted provider driving unit and scenario tests
    //!
    //! The script is a list of steps consumed in order; a step that
    //! waits for input parks the handshake in `WantRead` until enough
    //! bytes arrived at the right level.

    use super::*;

    #[derive(Debug)]
    pub enum Step {
        /// Park until at least `min_bytes` in-order bytes arrived at `level`
        ExpectData {
            level: EncryptionLevel,
            min_bytes: usize,
        },
        /// Install traffic secrets for `level`
        EmitSecrets {
            level: EncryptionLevel,
            suite: CipherSuite,
            rx: Vec<u8>,
            tx: Vec<u8>,
        },
        /// Emit handshake bytes at `level`
        EmitCrypto {
            level: EncryptionLevel,
            data: Vec<u8>,
        },
        /// Report the handshake complete
        Complete,
    }

    #[derive(Debug, Default)]
    pub struct Session {
        script: std::collections::VecDeque<Step>,
        received: [usize; EncryptionLevel::COUNT],
        local_parameters: Vec<u8>,
        peer_parameters: Option<Vec<u8>>,
        complete: bool,
    }

    impl Session {
        pub fn new(script: Vec<Step>) -> Self {
            Self {
                script: script.into(),
                ..Self::default()
            }
        }

        pub fn with_peer_parameters(mut self, parameters: Vec<u8>) -> Self {
            self.peer_parameters = Some(parameters);
            self
        }

        pub fn is_complete(&self) -> bool {
            self.complete
        }

        pub fn received_at(&self, level: EncryptionLevel) -> usize {
            self.received[level.index()]
        }

        pub fn local_parameters(&self) -> &[u8] {
            &self.local_parameters
        }

        fn run(&mut self, output: &mut dyn Output) -> Result<HandshakeStatus, Error> {
            while let Some(step) = self.script.pop_front() {
                match step {
                    Step::ExpectData { level, min_bytes } => {
                        if self.received[level.index()] < min_bytes {
                            self.script.push_front(Step::ExpectData { level, min_bytes });
                            return Ok(HandshakeStatus::WantRead);
                        }
                    }
                    Step::EmitSecrets { level, suite, rx, tx } => {
                        output.on_secrets(level, suite, Some(&rx), Some(&tx))?;
                    }
                    Step::EmitCrypto { level, data } => {
                        output.emit_crypto(level, &data)?;
                    }
                    Step::Complete => self.complete = true,
                }
            }
            if self.complete {
                Ok(HandshakeStatus::Complete)
            } else {
                Ok(HandshakeStatus::WantRead)
            }
        }
    }

    impl super::Session for Session {
        fn provide_data(
            &mut self,
            level: EncryptionLevel,
            data: &[u8],
            output: &mut dyn Output,
        ) -> Result<(), Error> {
            self.received[level.index()] += data.len();
            // scripted sessions make progress eagerly, like a provider
            // invoking its callbacks from within the feed call
            self.run(output).map(|_| ())
        }

        fn do_handshake(&mut self, output: &mut dyn Output) -> Result<HandshakeStatus, Error> {
            self.run(output)
        }

        fn set_transport_parameters(&mut self, encoded: &[u8]) {
            self.local_parameters = encoded.to_vec();
        }

        fn peer_transport_parameters(&self) -> Option<&[u8]> {
            self.peer_parameters.as_deref()
        }
    }
}
