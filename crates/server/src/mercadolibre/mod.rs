//! MercadoLibre API integration.
//!
//! # Architecture
//!
//! - OAuth 2.0 authorization code grant with PKCE (`S256`) against the
//!   regional consent page, token exchange against the API host
//! - One shared [`Transport`] per process: every outgoing request waits on a
//!   single rate limiter and goes through the same retry policy
//! - Refresh tokens are single use; callers must persist the rotated pair
//!   before anything else touches the account
//!
//! Only manager (primary) accounts may be connected. Collaborator ("operator")
//! accounts are rejected during the exchange, see [`account`].

pub mod account;
pub mod client;
pub mod oauth;
pub mod pkce;
pub mod retry;
pub mod transport;
pub mod types;

pub use client::MercadoLibreClient;
pub use oauth::{MlToken, OAuthClient};
pub use pkce::{PkceChallenge, PkceVerifier};
pub use transport::Transport;
pub use types::*;

use thiserror::Error;

/// Errors that can occur when interacting with MercadoLibre.
#[derive(Debug, Error)]
pub enum MercadoLibreError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body did not match the expected shape.
    #[error("JSON parse error: {0}")]
    Parse(String),

    /// A request URL could not be built.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Rate limited by MercadoLibre after exhausting retries.
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// The access token was rejected.
    #[error("Access token rejected: {0}")]
    Unauthorized(String),

    /// The authorization code or refresh token is invalid, expired or
    /// already used.
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    /// The authorizing account is a collaborator of another seller.
    #[error("Collaborator accounts cannot be connected, sign in with the main account")]
    CollaboratorAccount,

    /// The profile returned for the token belongs to a different account.
    #[error("Account mismatch: token issued for {expected}, profile is {actual}")]
    AccountMismatch {
        /// Account id from the token response.
        expected: i64,
        /// Account id from `/users/me`.
        actual: i64,
    },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// OAuth endpoint returned an error other than `invalid_grant`.
    #[error("OAuth error {error}: {message}")]
    OAuth {
        /// Machine readable error code.
        error: String,
        /// Human readable message.
        message: String,
    },

    /// Any other non-success API response.
    #[error("API error {status} {error}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Machine readable error code.
        error: String,
        /// Human readable message.
        message: String,
    },
}

impl MercadoLibreError {
    /// Whether the stored credentials can no longer be used without the user
    /// authorizing again.
    #[must_use]
    pub const fn requires_reauthorization(&self) -> bool {
        matches!(self, Self::InvalidGrant(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MercadoLibreError::RateLimited(30);
        assert_eq!(err.to_string(), "Rate limited, retry after 30 seconds");

        let err = MercadoLibreError::Api {
            status: 400,
            error: "bad_request".to_string(),
            message: "q is required".to_string(),
        };
        assert_eq!(err.to_string(), "API error 400 bad_request: q is required");
    }

    #[test]
    fn test_only_invalid_grant_requires_reauthorization() {
        assert!(MercadoLibreError::InvalidGrant("expired".to_string()).requires_reauthorization());
        assert!(!MercadoLibreError::RateLimited(1).requires_reauthorization());
        assert!(!MercadoLibreError::Unauthorized("x".to_string()).requires_reauthorization());
    }
}
