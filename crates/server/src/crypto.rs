//! Encryption at rest for MercadoLibre OAuth tokens.
//!
//! Tokens are sealed with AES-256-GCM under a random 96-bit nonce and stored
//! as `base64(nonce || ciphertext)`. The GCM tag makes tampering with a
//! stored row a decryption error instead of a garbage token.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Errors from sealing or opening a stored token.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be {KEY_LEN} bytes of base64")]
    InvalidKey,

    #[error("token encryption failed")]
    Encrypt,

    /// Wrong key, truncated payload or modified ciphertext.
    #[error("stored token could not be decrypted")]
    Decrypt,
}

/// AES-256-GCM cipher for token columns.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl TokenCipher {
    /// Create a cipher from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` unless `key` is exactly 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Create a cipher from a standard base64 key, as found in configuration.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the key is not base64 or is not 32 bytes.
    pub fn from_base64_key(key: &SecretString) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(key.expose_secret().trim())
            .map_err(|_| CryptoError::InvalidKey)?;
        Self::new(&bytes)
    }

    /// Seal a token for storage.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Encrypt` if the AEAD rejects the input.
    pub fn encrypt(&self, plaintext: &SecretString) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.expose_secret().as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    /// Open a stored token.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Decrypt` for malformed input, a different key or
    /// a modified ciphertext.
    pub fn decrypt(&self, sealed: &str) -> Result<SecretString, CryptoError> {
        let bytes = STANDARD.decode(sealed).map_err(|_| CryptoError::Decrypt)?;
        if bytes.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        let plaintext = String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt)?;

        Ok(SecretString::from(plaintext))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cipher() -> TokenCipher {
        TokenCipher::new(&[7u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        let cipher = cipher();
        let token = SecretString::from("APP_USR-123456-101010-abcdef-987654321");

        let sealed = cipher.encrypt(&token).unwrap();
        assert!(!sealed.contains("APP_USR"));

        let opened = cipher.decrypt(&sealed).unwrap();
        assert_eq!(opened.expose_secret(), token.expose_secret());
    }

    #[test]
    fn test_nonce_differs_per_call() {
        let cipher = cipher();
        let token = SecretString::from("TG-same-token");
        assert_ne!(
            cipher.encrypt(&token).unwrap(),
            cipher.encrypt(&token).unwrap()
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = cipher().encrypt(&SecretString::from("TG-abc")).unwrap();
        let other = TokenCipher::new(&[9u8; KEY_LEN]).unwrap();
        assert!(matches!(other.decrypt(&sealed), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = cipher();
        let sealed = cipher.encrypt(&SecretString::from("TG-abc")).unwrap();
        let mut bytes = STANDARD.decode(&sealed).unwrap();
        if let Some(last) = bytes.last_mut() {
            *last ^= 0x01;
        }
        let tampered = STANDARD.encode(bytes);
        assert!(matches!(cipher.decrypt(&tampered), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn test_malformed_input_fails() {
        let cipher = cipher();
        assert!(cipher.decrypt("%%%").is_err());
        assert!(cipher.decrypt(&STANDARD.encode([0u8; NONCE_LEN])).is_err());
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(matches!(
            TokenCipher::new(&[0u8; 16]),
            Err(CryptoError::InvalidKey)
        ));
        let key = SecretString::from(STANDARD.encode([1u8; KEY_LEN]));
        assert!(TokenCipher::from_base64_key(&key).is_ok());
    }
}
