//! Symmetric encryption for stored provider API keys.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use thiserror::Error;

const VERSION_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("unsupported ciphertext format")]
    UnsupportedFormat,
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

#[derive(Clone)]
pub struct KeyVault {
    cipher: Aes256Gcm,
}

impl KeyVault {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypts `plaintext` into `v1:<base64(nonce || ciphertext)>`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(nonce.as_slice());
        payload.extend_from_slice(&ciphertext);

        Ok(format!("{VERSION_PREFIX}{}", STANDARD.encode(payload)))
    }

    /// Values without a `:` predate encryption and are returned as-is.
    pub fn decrypt(&self, stored: &str) -> Result<String, VaultError> {
        if !stored.contains(':') {
            return Ok(stored.to_owned());
        }

        let encoded = stored
            .strip_prefix(VERSION_PREFIX)
            .ok_or(VaultError::UnsupportedFormat)?;
        let payload = STANDARD
            .decode(encoded)
            .map_err(|error| VaultError::Malformed(error.to_string()))?;

        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::Malformed("payload too short".to_string()));
        }

        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VaultError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|error| VaultError::Malformed(error.to_string()))
    }
}

/// Display form of a key: the first and last four characters.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_recovers_key() {
        let vault = KeyVault::new("unit-test-secret");
        let stored = vault.encrypt("sk-live-1234567890").unwrap();

        assert!(stored.starts_with("v1:"));
        assert!(!stored.contains("sk-live"));
        assert_eq!(vault.decrypt(&stored).unwrap(), "sk-live-1234567890");
    }

    #[test]
    fn encryption_uses_fresh_nonce() {
        let vault = KeyVault::new("unit-test-secret");
        let first = vault.encrypt("same").unwrap();
        let second = vault.encrypt("same").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn legacy_plaintext_passes_through() {
        let vault = KeyVault::new("unit-test-secret");
        assert_eq!(vault.decrypt("sk-plain").unwrap(), "sk-plain");
    }

    #[test]
    fn wrong_secret_fails_to_decrypt() {
        let stored = KeyVault::new("one").encrypt("sk-secret").unwrap();
        let error = KeyVault::new("two").decrypt(&stored).unwrap_err();
        assert!(matches!(error, VaultError::Decrypt));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let vault = KeyVault::new("unit-test-secret");
        assert!(matches!(
            vault.decrypt("v2:abc").unwrap_err(),
            VaultError::UnsupportedFormat
        ));
        assert!(matches!(
            vault.decrypt("v1:c2hvcnQ=").unwrap_err(),
            VaultError::Malformed(_)
        ));
    }

    #[test]
    fn mask_key_hides_the_middle() {
        assert_eq!(mask_key("sk-abcdefghijkl"), "sk-a...ijkl");
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key(""), "****");
    }
}
