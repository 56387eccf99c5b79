// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{
    key::{hkdf_expand_label, LevelKeys},
    suite::CipherSuite,
    Error,
};
use crate::endpoint;
use hex_literal::hex;
use ring::hkdf;
use zeroize::Zeroizing;

//= https://tools.ietf.org/id/draft-ietf-quic-tls-28.txt#5.2
//# initial_salt = 0xc3eef712c72ebb5a11a7d2432bb46365bef9f502
//# initial_secret = HKDF-Extract(initial_salt,
//#                               client_dst_connection_id)

pub const INITIAL_SALT: [u8; 20] = hex!("c3eef712c72ebb5a11a7d2432bb46365bef9f502");

const CLIENT_LABEL: &[u8] = b"client in";
const SERVER_LABEL: &[u8] = b"server in";

const SECRET_LEN: usize = 32;

struct SecretLen;

impl hkdf::KeyType for SecretLen {
    fn len(&self) -> usize {
        SECRET_LEN
    }
}

/// Derives the Initial-level key pair from the client's first DCID
///
/// Initial packets are always protected under AES-128-GCM/SHA-256,
/// whatever suite the handshake later negotiates.
pub fn initial_keys(
    peer_dcid: &[u8],
    local_endpoint: endpoint::Type,
) -> Result<LevelKeys, Error> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT);
    let initial = salt.extract(peer_dcid);

    let mut initial_secret = Zeroizing::new([0u8; SECRET_LEN]);
    initial
        .expand(&[], SecretLen)
        .and_then(|okm| okm.fill(&mut initial_secret[..]))
        .map_err(|_| Error::KEY_DERIVATION_FAILED)?;

    let mut client = Zeroizing::new([0u8; SECRET_LEN]);
    let mut server = Zeroizing::new([0u8; SECRET_LEN]);
    hkdf_expand_label(hkdf::HKDF_SHA256, &initial_secret[..], CLIENT_LABEL, &mut client[..])?;
    hkdf_expand_label(hkdf::HKDF_SHA256, &initial_secret[..], SERVER_LABEL, &mut server[..])?;

    let (rx, tx) = match local_endpoint {
        endpoint::Type::Server => (client, server),
        endpoint::Type::Client => (server, client),
    };

    let mut keys = LevelKeys::new();
    keys.install_rx(CipherSuite::Aes128GcmSha256, &rx[..])?;
    keys.install_tx(CipherSuite::Aes128GcmSha256, &tx[..])?;
    Ok(keys)
}
