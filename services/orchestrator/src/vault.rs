//! Credential vault: AES-256-GCM encryption of upstream API keys at rest.
//!
//! # Blob layout
//! `[version: 1 byte][nonce: 12 bytes][ciphertext ‖ tag]`, version 0x01.
//! A fresh random 96-bit nonce is drawn for every encryption, so the same
//! plaintext never produces the same blob twice.
//!
//! # Key handling
//! The 256-bit secret key is loaded once at startup from config (64 hex
//! chars) and is immutable for the process lifetime. Rotation is an
//! out-of-band operation backed by the verifier pair below.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use thiserror::Error;

const BLOB_VERSION: u8 = 0x01;
const NONCE_LEN: usize = 12;
/// Fixed plaintext for the backup/restore key cross-check.
const VERIFIER_PLAINTEXT: &str = "sweeparr-vault-verifier-v1";

#[derive(Debug, Error)]
pub enum VaultError {
    /// Missing or malformed secret key; also raised when the process key
    /// cannot produce a cipher at all.
    #[error("secret key: {0}")]
    SecretKey(String),
    /// Tag mismatch or malformed blob; the key is loaded but this blob
    /// does not decrypt under it.
    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Process-wide encryption engine for connector API keys.
pub struct Vault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    /// Build the vault from a 64-hex-char key string.
    pub fn from_hex_key(hex_key: &str) -> Result<Self, VaultError> {
        let key_bytes = hex::decode(hex_key.trim())
            .map_err(|e| VaultError::SecretKey(format!("key is not valid hex: {e}")))?;
        if key_bytes.len() != 32 {
            return Err(VaultError::SecretKey(format!(
                "key must be 32 bytes (64 hex chars), got {} bytes",
                key_bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Vault {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt a plaintext secret into a versioned blob.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::SecretKey("encryption failed".to_owned()))?;

        let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a versioned blob back into the plaintext secret.
    pub fn decrypt(&self, blob: &[u8]) -> Result<String, VaultError> {
        if blob.len() < 1 + NONCE_LEN + 16 {
            return Err(VaultError::Decryption("blob too short".to_owned()));
        }
        if blob[0] != BLOB_VERSION {
            return Err(VaultError::Decryption(format!(
                "unknown blob version {:#04x}",
                blob[0]
            )));
        }
        let nonce = Nonce::from_slice(&blob[1..1 + NONCE_LEN]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &blob[1 + NONCE_LEN..])
            .map_err(|_| VaultError::Decryption("authentication tag mismatch".to_owned()))?;
        String::from_utf8(plaintext)
            .map_err(|_| VaultError::Decryption("plaintext is not UTF-8".to_owned()))
    }

    /// Encrypt the fixed verifier plaintext.
    ///
    /// Persisted at backup time; proving the blob still decrypts at
    /// restore time is the only persisted cross-check that the restoring
    /// process holds the same key.
    pub fn verifier_blob(&self) -> Result<Vec<u8>, VaultError> {
        self.encrypt(VERIFIER_PLAINTEXT)
    }

    /// Check a stored verifier blob against the loaded key.
    pub fn check_verifier(&self, blob: &[u8]) -> Result<(), VaultError> {
        let plaintext = self.decrypt(blob)?;
        if plaintext == VERIFIER_PLAINTEXT {
            Ok(())
        } else {
            Err(VaultError::Decryption(
                "verifier plaintext mismatch".to_owned(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> Vault {
        Vault::from_hex_key(&"a1".repeat(32)).unwrap()
    }

    #[test]
    fn round_trip_recovers_plaintext_and_blob_differs_from_input() {
        let vault = test_vault();
        let blob = vault.encrypt("super-secret-api-key").unwrap();
        assert_eq!(blob[0], 0x01);
        assert_ne!(blob.as_slice(), b"super-secret-api-key".as_slice());
        assert_eq!(vault.decrypt(&blob).unwrap(), "super-secret-api-key");
    }

    #[test]
    fn encrypting_twice_yields_different_blobs() {
        let vault = test_vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b, "fresh nonce per encryption");
    }

    #[test]
    fn wrong_key_fails_with_decryption_error() {
        let blob = test_vault().encrypt("secret").unwrap();
        let other = Vault::from_hex_key(&"b2".repeat(32)).unwrap();
        match other.decrypt(&blob) {
            Err(VaultError::Decryption(_)) => {}
            other => panic!("expected Decryption error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_keys_fail_with_secret_key_error() {
        for bad in ["", "abcd", "zz", &"a1".repeat(16)] {
            match Vault::from_hex_key(bad) {
                Err(VaultError::SecretKey(_)) => {}
                other => panic!("expected SecretKey error for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let vault = test_vault();
        let mut blob = vault.encrypt("secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(matches!(vault.decrypt(&blob), Err(VaultError::Decryption(_))));
    }

    #[test]
    fn truncated_and_wrong_version_blobs_are_rejected() {
        let vault = test_vault();
        assert!(matches!(vault.decrypt(&[0x01, 2, 3]), Err(VaultError::Decryption(_))));
        let mut blob = vault.encrypt("secret").unwrap();
        blob[0] = 0x7f;
        assert!(matches!(vault.decrypt(&blob), Err(VaultError::Decryption(_))));
    }

    #[test]
    fn verifier_round_trip_proves_matching_key() {
        let vault = test_vault();
        let blob = vault.verifier_blob().unwrap();
        vault.check_verifier(&blob).unwrap();

        let other = Vault::from_hex_key(&"c3".repeat(32)).unwrap();
        assert!(other.check_verifier(&blob).is_err());
    }
}
