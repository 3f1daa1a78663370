//! Cryptographic primitives for the credential vault.
//!
//! AES-256-GCM authenticated encryption with zeroize-on-drop key newtypes,
//! and PBKDF2-HMAC-SHA256 to derive the vault's root key from a master
//! password (spec §3: 100 000 iterations, 32-byte key, per-vault salt).
//!
//! Ciphertext format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`,
//! matching the wire format used throughout the broader vault ecosystem this
//! crate was generalized from.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::VaultError;

const MIN_CIPHERTEXT_LEN: usize = 12 + 16;
const NONCE_LEN: usize = 12;

/// PBKDF2 iteration count for master-password-derived keys (spec §3).
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// A 256-bit encryption key, zeroized on drop and never printed in `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey").field("bytes", &"[REDACTED]").finish()
    }
}

/// Derive the vault's root key from a master password and a per-vault salt
/// using PBKDF2-HMAC-SHA256 with [`PBKDF2_ITERATIONS`] rounds.
#[must_use]
pub fn derive_master_key(password: &[u8], salt: &[u8]) -> EncryptionKey {
    let mut derived = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, PBKDF2_ITERATIONS, &mut derived);
    EncryptionKey::from_bytes(derived)
}

/// Second-layer key used by `export`, derived with a fixed salt so an
/// exported bundle can be re-derived from the export password alone.
#[must_use]
pub fn derive_export_key(password: &[u8]) -> EncryptionKey {
    derive_master_key(password, b"fleetd-vault-export-salt-v1")
}

/// Encrypt `plaintext` with a fresh random nonce.
///
/// # Errors
///
/// Returns [`VaultError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// Decrypt ciphertext produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`VaultError::CiphertextTooShort`] if shorter than 28 bytes, or
/// [`VaultError::Decryption`] if authentication fails.
pub fn decrypt(key: &EncryptionKey, combined: &[u8]) -> Result<Vec<u8>, VaultError> {
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(VaultError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: combined.len(),
        });
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher.decrypt(nonce, ciphertext).map_err(|e| VaultError::Decryption(e.to_string()))
}

/// Generate a fresh random salt suitable for [`derive_master_key`].
#[must_use]
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt(&key, b"secret data").unwrap();
        assert_eq!(decrypt(&key, &ciphertext).unwrap(), b"secret data");
    }

    #[test]
    fn decrypt_wrong_key_fails() {
        let key1 = EncryptionKey::generate();
        let key2 = EncryptionKey::generate();
        let ciphertext = encrypt(&key1, b"secret").unwrap();
        assert!(decrypt(&key2, &ciphertext).is_err());
    }

    #[test]
    fn decrypt_tampered_fails() {
        let key = EncryptionKey::generate();
        let mut ciphertext = encrypt(&key, b"secret").unwrap();
        ciphertext[NONCE_LEN] ^= 0xFF;
        assert!(decrypt(&key, &ciphertext).is_err());
    }

    #[test]
    fn decrypt_too_short_fails() {
        let key = EncryptionKey::generate();
        assert!(matches!(
            decrypt(&key, &[0u8; 5]),
            Err(VaultError::CiphertextTooShort { expected: 28, actual: 5 })
        ));
    }

    #[test]
    fn derive_master_key_is_deterministic_for_same_salt() {
        let k1 = derive_master_key(b"hunter2", b"fixed-salt");
        let k2 = derive_master_key(b"hunter2", b"fixed-salt");
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn derive_master_key_differs_with_salt() {
        let k1 = derive_master_key(b"hunter2", b"salt-a");
        let k2 = derive_master_key(b"hunter2", b"salt-b");
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn export_key_is_reproducible_from_password_alone() {
        let k1 = derive_export_key(b"export-pw");
        let k2 = derive_export_key(b"export-pw");
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn debug_redacts_key_bytes() {
        let key = EncryptionKey::generate();
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
