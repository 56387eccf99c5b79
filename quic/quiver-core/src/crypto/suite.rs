// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::Error;
use ring::{aead, hkdf};

/// The TLS 1.3 cipher suites recognized for packet protection
///
/// Each suite selects an (AEAD, hash, header-protection cipher) triple.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CipherSuite {
    Aes128GcmSha256,
    Aes256GcmSha384,
    ChaCha20Poly1305Sha256,
    /// Recognized but key installation is deferred (no provider support)
    Aes128CcmSha256,
}

impl CipherSuite {
    /// IANA cipher suite identifiers as conveyed by the TLS provider
    #[inline]
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x1301 => Some(Self::Aes128GcmSha256),
            0x1302 => Some(Self::Aes256GcmSha384),
            0x1303 => Some(Self::ChaCha20Poly1305Sha256),
            0x1304 => Some(Self::Aes128CcmSha256),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn aead(self) -> Result<&'static aead::Algorithm, Error> {
        match self {
            Self::Aes128GcmSha256 => Ok(&aead::AES_128_GCM),
            Self::Aes256GcmSha384 => Ok(&aead::AES_256_GCM),
            Self::ChaCha20Poly1305Sha256 => Ok(&aead::CHACHA20_POLY1305),
            Self::Aes128CcmSha256 => Err(Error::UNSUPPORTED_CIPHER_SUITE),
        }
    }

    #[inline]
    pub(crate) fn digest(self) -> hkdf::Algorithm {
        match self {
            Self::Aes256GcmSha384 => hkdf::HKDF_SHA384,
            _ => hkdf::HKDF_SHA256,
        }
    }

    #[inline]
    pub(crate) fn header_protection(self) -> Result<&'static aead::quic::Algorithm, Error> {
        match self {
            Self::Aes128GcmSha256 => Ok(&aead::quic::AES_128),
            Self::Aes256GcmSha384 => Ok(&aead::quic::AES_256),
            Self::ChaCha20Poly1305Sha256 => Ok(&aead::quic::CHACHA20),
            Self::Aes128CcmSha256 => Err(Error::UNSUPPORTED_CIPHER_SUITE),
        }
    }

    /// The length of secrets produced under this suite's hash
    #[inline]
    pub fn secret_len(self) -> usize {
        match self {
            Self::Aes256GcmSha384 => 48,
            _ => 32,
        }
    }

    #[inline]
    pub(crate) fn key_len(self) -> Result<usize, Error> {
        Ok(self.aead()?.key_len())
    }
}
