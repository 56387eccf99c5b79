// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// A fatal cryptographic failure
///
/// Open failures drop the offending packet silently; every other variant
/// fails the connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Error {
    reason: &'static str,
}

impl Error {
    pub const DECRYPT_ERROR: Self = Self::new("packet decryption failed");
    pub const ENCRYPT_ERROR: Self = Self::new("packet encryption failed");
    pub const HEADER_PROTECTION_ERROR: Self = Self::new("header protection failed");
    pub const KEY_DERIVATION_FAILED: Self = Self::new("key derivation failed");
    pub const UNSUPPORTED_CIPHER_SUITE: Self = Self::new("unsupported cipher suite");

    pub const fn new(reason: &'static str) -> Self {
        Self { reason }
    }

    pub const fn reason(&self) -> &'static str {
        self.reason
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<ring::error::Unspecified> for Error {
    #[inline]
    fn from(_: ring::error::Unspecified) -> Self {
        Self::DECRYPT_ERROR
    }
}
