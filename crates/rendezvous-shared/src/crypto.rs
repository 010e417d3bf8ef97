//! Encryption at rest.
//!
//! Sealed values are self-describing envelopes:
//!
//! ```text
//! version (1 byte) || nonce (24 bytes) || XChaCha20-Poly1305 ciphertext
//! ```
//!
//! The version byte is bound into the AEAD as associated data, so a value
//! cannot be replayed under a different envelope version.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{KDF_CONTEXT_FIELD_KEY, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Current envelope layout.
pub const ENVELOPE_VERSION: u8 = 1;

const HEADER_LEN: usize = 1 + NONCE_SIZE;

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Interpret raw bytes read back from a secret store as a symmetric key.
pub fn key_from_slice(bytes: &[u8]) -> Result<SymmetricKey, CryptoError> {
    SymmetricKey::try_from(bytes).map_err(|_| CryptoError::InvalidKeyLength {
        expected: SYMMETRIC_KEY_SIZE,
        actual: bytes.len(),
    })
}

pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let version = [ENVELOPE_VERSION];
    let sealed = XChaCha20Poly1305::new(key.into())
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &version,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut envelope = Vec::with_capacity(HEADER_LEN + sealed.len());
    envelope.push(ENVELOPE_VERSION);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&sealed);
    Ok(envelope)
}

pub fn decrypt(key: &SymmetricKey, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let Some((&version, rest)) = envelope.split_first() else {
        return Err(CryptoError::DecryptionFailed);
    };
    if version != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion(version));
    }
    if rest.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce, sealed) = rest.split_at(NONCE_SIZE);
    XChaCha20Poly1305::new(key.into())
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: sealed,
                aad: &[version],
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Key for the sealed columns.  Derived with BLAKE3 in its own context so it
/// never equals the store key, which SQLCipher may be keyed with too.
pub fn derive_field_key(store_key: &SymmetricKey) -> SymmetricKey {
    blake3::derive_key(KDF_CONTEXT_FIELD_KEY, store_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_value_opens_with_same_key() {
        let key = generate_symmetric_key();
        let envelope = encrypt(&key, b"see you at the bar on 5th").unwrap();

        assert_eq!(envelope[0], ENVELOPE_VERSION);
        assert_eq!(decrypt(&key, &envelope).unwrap(), b"see you at the bar on 5th");
    }

    #[test]
    fn wrong_key_fails() {
        let envelope = encrypt(&generate_symmetric_key(), b"secret").unwrap();
        assert!(matches!(
            decrypt(&generate_symmetric_key(), &envelope),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn tampering_is_detected() {
        let key = generate_symmetric_key();
        let mut envelope = encrypt(&key, b"important").unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0xFF;
        assert!(decrypt(&key, &envelope).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let key = generate_symmetric_key();
        let mut envelope = encrypt(&key, b"x").unwrap();
        envelope[0] = 9;
        assert!(matches!(
            decrypt(&key, &envelope),
            Err(CryptoError::UnsupportedVersion(9))
        ));
        assert!(decrypt(&key, &[]).is_err());
        assert!(decrypt(&key, &[ENVELOPE_VERSION, 1, 2]).is_err());
    }

    #[test]
    fn key_from_slice_checks_length() {
        assert!(key_from_slice(&[0u8; 16]).is_err());
        assert_eq!(key_from_slice(&[7u8; 32]).unwrap(), [7u8; 32]);
    }

    #[test]
    fn field_key_is_deterministic_and_distinct() {
        let key = generate_symmetric_key();
        assert_eq!(derive_field_key(&key), derive_field_key(&key));
        assert_ne!(derive_field_key(&key), key);
    }
}
