//! Machine-bound token vault.
//!
//! The remote-repository credential is sealed with AES-256-GCM under a key
//! derived from the current OS user and hostname, so the ciphertext is inert
//! if the data directory is copied to another machine. Serialized form is
//! base64(nonce ‖ ciphertext ‖ tag).

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// 96-bit GCM nonce.
const NONCE_LEN: usize = 12;
/// Fixed application tag mixed into the key material.
const APP_TAG: &str = "Lumina:v1";

/// Seals and unseals a single credential at rest.
pub struct TokenVault {
    cipher: Aes256Gcm,
}

impl TokenVault {
    /// Builds a vault keyed to the current user and machine.
    pub fn new() -> Self {
        Self::with_key_material(&key_material())
    }

    fn with_key_material(material: &str) -> Self {
        let key_bytes = Sha256::digest(material.as_bytes());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        Self { cipher }
    }

    /// Encrypts a plaintext credential into an opaque base64 string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.trim().is_empty() {
            return Err(Error::InvalidInput("Cannot encrypt an empty value".to_string()));
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| Error::Internal("Encryption failed".to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    /// Decrypts an opaque string produced by [`encrypt`](Self::encrypt).
    ///
    /// Fails closed with [`Error::DecryptFailed`] if authentication fails,
    /// which happens when the ciphertext was sealed under a different
    /// user/host key or has been tampered with.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        if encoded.trim().is_empty() {
            return Err(Error::InvalidInput("Cannot decrypt an empty value".to_string()));
        }
        let combined = BASE64.decode(encoded).map_err(|_| Error::DecryptFailed)?;
        if combined.len() <= NONCE_LEN {
            return Err(Error::DecryptFailed);
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| Error::DecryptFailed)
    }
}

impl Default for TokenVault {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable host-identifying key material: `user:host:app-tag`.
fn key_material() -> String {
    let username = whoami::username();
    let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "unknown_host".to_string());
    format!("{}:{}:{}", username, hostname, APP_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let vault = TokenVault::new();
        for s in ["hf_abc123", "x", "token with spaces", "ünïcødé-tøken"] {
            let sealed = vault.encrypt(s).unwrap();
            assert_ne!(sealed, s);
            assert_eq!(vault.decrypt(&sealed).unwrap(), s);
        }
    }

    #[test]
    fn test_nonce_makes_ciphertexts_differ() {
        let vault = TokenVault::new();
        let a = vault.encrypt("same-token").unwrap();
        let b = vault.encrypt("same-token").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_input_rejected() {
        let vault = TokenVault::new();
        assert!(vault.encrypt("").is_err());
        assert!(vault.encrypt("   ").is_err());
        assert!(vault.decrypt("").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails_closed() {
        let vault = TokenVault::new();
        let sealed = vault.encrypt("hf_secret").unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        // Flip one bit somewhere in the ciphertext body.
        let idx = raw.len() - 1;
        raw[idx] ^= 0x01;
        let tampered = BASE64.encode(raw);
        match vault.decrypt(&tampered) {
            Err(Error::DecryptFailed) => {}
            other => panic!("expected DecryptFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_different_host_key_cannot_decrypt() {
        let here = TokenVault::with_key_material("alice:laptop:Lumina:v1");
        let there = TokenVault::with_key_material("alice:desktop:Lumina:v1");
        let sealed = here.encrypt("hf_secret").unwrap();
        assert!(matches!(there.decrypt(&sealed), Err(Error::DecryptFailed)));
        assert_eq!(here.decrypt(&sealed).unwrap(), "hf_secret");
    }

    #[test]
    fn test_garbage_input_fails_closed() {
        let vault = TokenVault::new();
        assert!(matches!(vault.decrypt("not base64 at all!!"), Err(Error::DecryptFailed)));
        assert!(matches!(vault.decrypt("QUJD"), Err(Error::DecryptFailed)));
    }
}
