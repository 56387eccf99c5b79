// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet protection: AEAD keys, header protection and the per-level
//! cryptographic context.
//!
//! Key schedule inputs come from the TLS provider as raw secrets; this
//! module derives the packet-protection key, iv and header-protection key
//! for each of them and applies/removes both protections.

mod error;
mod header;
mod initial;
mod key;
mod suite;

pub use error::Error;
pub use header::{apply_header_protection, remove_header_protection, HeaderProtectionMask};
pub use initial::{initial_keys, INITIAL_SALT};
pub use key::{hkdf_expand_label, LevelKeys, OneWayKeys};
pub use suite::CipherSuite;

/// The AEAD authentication tag length shared by all recognized suites
pub const TAG_LEN: usize = 16;

/// Header protection samples 16 bytes of ciphertext
pub const SAMPLE_LEN: usize = 16;
