// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{suite::CipherSuite, Error};
use ring::{aead, hkdf};
use zeroize::Zeroizing;

//= https://tools.ietf.org/id/draft-ietf-quic-tls-28.txt#5.1
//# The current encryption level secret and the label "quic key" are
//# input to the KDF to produce the AEAD key; the label "quic iv" is used
//# to derive the IV, see Section 5.3.  The header protection key uses
//# the "quic hp" label, see Section 5.4.

const KEY_LABEL: &[u8] = b"quic key";
const IV_LABEL: &[u8] = b"quic iv";
const HP_LABEL: &[u8] = b"quic hp";

pub(crate) const IV_LEN: usize = 12;

struct OutLen(usize);

impl hkdf::KeyType for OutLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label with the `tls13 ` prefix and an empty context
pub fn hkdf_expand_label(
    digest: hkdf::Algorithm,
    secret: &[u8],
    label: &[u8],
    out: &mut [u8],
) -> Result<(), Error> {
    let label_len = 6 + label.len();
    debug_assert!(label_len <= 255 && out.len() <= u16::MAX as usize);

    // HkdfLabel: u16 length, opaque label<7..255>, opaque context<0..255>
    let mut info = Zeroizing::new([0u8; 2 + 1 + 255 + 1]);
    info[0] = (out.len() >> 8) as u8;
    info[1] = out.len() as u8;
    info[2] = label_len as u8;
    info[3..9].copy_from_slice(b"tls13 ");
    info[9..9 + label.len()].copy_from_slice(label);
    info[9 + label.len()] = 0;
    let info_len = 2 + 1 + label_len + 1;

    let prk = hkdf::Prk::new_less_safe(digest, secret);
    let info_slices = [&info[..info_len]];
    let okm = prk
        .expand(&info_slices, OutLen(out.len()))
        .map_err(|_| Error::KEY_DERIVATION_FAILED)?;
    okm.fill(out).map_err(|_| Error::KEY_DERIVATION_FAILED)?;
    Ok(())
}

/// The packet-protection material for one direction of one level:
/// the AEAD key, the iv the nonce is built from, and the header
/// protection key.
pub struct OneWayKeys {
    suite: CipherSuite,
    key: aead::LessSafeKey,
    iv: Zeroizing<[u8; IV_LEN]>,
    hp: aead::quic::HeaderProtectionKey,
}

impl core::fmt::Debug for OneWayKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("OneWayKeys")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

impl OneWayKeys {
    /// Derives key, iv and hp-key from a traffic secret
    pub fn derive(suite: CipherSuite, secret: &[u8]) -> Result<Self, Error> {
        let digest = suite.digest();

        let mut key = Zeroizing::new([0u8; 32]);
        let key = &mut key[..suite.key_len()?];
        hkdf_expand_label(digest, secret, KEY_LABEL, key)?;

        let mut iv = Zeroizing::new([0u8; IV_LEN]);
        hkdf_expand_label(digest, secret, IV_LABEL, &mut iv[..])?;

        let hp_alg = suite.header_protection()?;
        let mut hp_key = Zeroizing::new([0u8; 32]);
        let hp_key = &mut hp_key[..hp_alg.key_len()];
        hkdf_expand_label(digest, secret, HP_LABEL, hp_key)?;

        let key = aead::LessSafeKey::new(
            aead::UnboundKey::new(suite.aead()?, key).map_err(|_| Error::KEY_DERIVATION_FAILED)?,
        );
        let hp = aead::quic::HeaderProtectionKey::new(hp_alg, hp_key)
            .map_err(|_| Error::KEY_DERIVATION_FAILED)?;

        Ok(Self {
            suite,
            key,
            iv,
            hp,
        })
    }

    #[inline]
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    //= https://tools.ietf.org/id/draft-ietf-quic-tls-28.txt#5.3
    //# The nonce, N, is formed by combining the packet
    //# protection IV with the packet number.  The 62 bits of the
    //# reconstructed QUIC packet number in network byte order are left-
    //# padded with zeros to the size of the IV.  The exclusive OR of the
    //# padded packet number and the IV forms the AEAD nonce.
    #[inline]
    fn nonce(&self, packet_number: u64) -> aead::Nonce {
        let mut nonce = *self.iv;
        for (nonce_byte, pn_byte) in nonce[IV_LEN - 8..]
            .iter_mut()
            .zip(packet_number.to_be_bytes())
        {
            *nonce_byte ^= pn_byte;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }

    /// Encrypts `payload` in place and returns the 16-byte tag
    pub fn seal(
        &self,
        packet_number: u64,
        aad: &[u8],
        payload: &mut [u8],
    ) -> Result<[u8; super::TAG_LEN], Error> {
        let tag = self
            .key
            .seal_in_place_separate_tag(self.nonce(packet_number), aead::Aad::from(aad), payload)
            .map_err(|_| Error::ENCRYPT_ERROR)?;
        tag.as_ref()
            .try_into()
            .map_err(|_| Error::ENCRYPT_ERROR)
    }

    /// Decrypts `payload` (ciphertext followed by the tag) in place,
    /// returning the plaintext length
    pub fn open(
        &self,
        packet_number: u64,
        aad: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, Error> {
        let plaintext = self
            .key
            .open_in_place(self.nonce(packet_number), aead::Aad::from(aad), payload)
            .map_err(|_| Error::DECRYPT_ERROR)?;
        Ok(plaintext.len())
    }

    /// Computes the 5-byte header protection mask from a ciphertext sample
    #[inline]
    pub fn header_protection_mask(
        &self,
        sample: &[u8],
    ) -> Result<super::HeaderProtectionMask, Error> {
        self.hp
            .new_mask(sample)
            .map_err(|_| Error::HEADER_PROTECTION_ERROR)
    }
}

/// The rx/tx key pair of one encryption level
///
/// Keys arrive from the TLS provider one direction at a time; a direction
/// with no keys yet simply cannot protect or unprotect packets.
#[derive(Debug, Default)]
pub struct LevelKeys {
    rx: Option<OneWayKeys>,
    tx: Option<OneWayKeys>,
}

impl LevelKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_rx(&mut self, suite: CipherSuite, secret: &[u8]) -> Result<(), Error> {
        self.rx = Some(OneWayKeys::derive(suite, secret)?);
        Ok(())
    }

    pub fn install_tx(&mut self, suite: CipherSuite, secret: &[u8]) -> Result<(), Error> {
        self.tx = Some(OneWayKeys::derive(suite, secret)?);
        Ok(())
    }

    #[inline]
    pub fn rx(&self) -> Option<&OneWayKeys> {
        self.rx.as_ref()
    }

    #[inline]
    pub fn tx(&self) -> Option<&OneWayKeys> {
        self.tx.as_ref()
    }

    #[inline]
    pub fn has_rx(&self) -> bool {
        self.rx.is_some()
    }

    #[inline]
    pub fn has_tx(&self) -> bool {
        self.tx.is_some()
    }
}
