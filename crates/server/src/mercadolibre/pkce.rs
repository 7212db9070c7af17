//! Proof Key for Code Exchange (RFC 7636).
//!
//! A fresh verifier is created for every authorization attempt. Only its
//! `S256` challenge leaves the server before the token exchange.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

const VERIFIER_ENTROPY_BYTES: usize = 32;
const MIN_VERIFIER_LEN: usize = 43;
const MAX_VERIFIER_LEN: usize = 128;

/// The only challenge method we send.
pub const CHALLENGE_METHOD: &str = "S256";

/// A verifier string that breaks RFC 7636 section 4.1.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PkceError {
    #[error("code verifier must be {MIN_VERIFIER_LEN} to {MAX_VERIFIER_LEN} characters (got {0})")]
    Length(usize),
    #[error("code verifier contains a character outside [A-Za-z0-9-._~]")]
    Charset,
}

/// PKCE code verifier.
///
/// `Debug` is redacted; the verifier is as sensitive as the code it unlocks.
#[derive(Clone, PartialEq, Eq)]
pub struct PkceVerifier(String);

impl fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PkceVerifier([REDACTED])")
    }
}

impl PkceVerifier {
    /// Generate a verifier from 32 random bytes (43 url-safe characters).
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; VERIFIER_ENTROPY_BYTES];
        rand::rng().fill(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Accept an externally supplied verifier.
    ///
    /// # Errors
    ///
    /// Returns `PkceError` if the length or alphabet is outside RFC 7636.
    pub fn parse(value: &str) -> Result<Self, PkceError> {
        if !(MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&value.len()) {
            return Err(PkceError::Length(value.len()));
        }
        if !value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
        {
            return Err(PkceError::Charset);
        }
        Ok(Self(value.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `S256` challenge for this verifier.
    #[must_use]
    pub fn challenge(&self) -> PkceChallenge {
        let digest = Sha256::digest(self.0.as_bytes());
        PkceChallenge(URL_SAFE_NO_PAD.encode(digest))
    }
}

/// `BASE64URL(SHA256(verifier))`, safe to put in the authorization URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceChallenge(String);

impl PkceChallenge {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub const fn method(&self) -> &'static str {
        CHALLENGE_METHOD
    }
}

impl fmt::Display for PkceChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
