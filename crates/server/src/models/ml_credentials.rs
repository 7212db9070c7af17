//! Stored MercadoLibre connection.

use chrono::{DateTime, Duration, Utc};

use mercado_lister_core::{CredentialStatus, MlCredentialsId, MlSite, MlUserId, UserId};

/// A user's MercadoLibre connection as stored.
///
/// Token columns hold `TokenCipher` output, never plaintext. `Debug` redacts
/// them anyway.
#[derive(Clone)]
pub struct MlCredentials {
    pub id: MlCredentialsId,
    pub user_id: UserId,
    pub ml_user_id: MlUserId,
    pub nickname: String,
    pub site: MlSite,
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: String,
    pub scopes: Vec<String>,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
    pub status: CredentialStatus,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_validated_at: Option<DateTime<Utc>>,
    /// Last refresh or validation failure, cleared on success.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for MlCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlCredentials")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("ml_user_id", &self.ml_user_id)
            .field("nickname", &self.nickname)
            .field("site", &self.site)
            .field("access_token_encrypted", &"[REDACTED]")
            .field("refresh_token_encrypted", &"[REDACTED]")
            .field("scopes", &self.scopes)
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("refresh_token_expires_at", &self.refresh_token_expires_at)
            .field("status", &self.status)
            .field("last_refreshed_at", &self.last_refreshed_at)
            .field("last_validated_at", &self.last_validated_at)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl MlCredentials {
    /// Whether the access token expires before `now + within`.
    #[must_use]
    pub fn access_expires_within(&self, within: Duration, now: DateTime<Utc>) -> bool {
        self.access_token_expires_at <= now + within
    }

    /// Whether the refresh token has outlived its lifetime.
    #[must_use]
    pub fn refresh_token_expired(&self, now: DateTime<Utc>) -> bool {
        self.refresh_token_expires_at <= now
    }
}

/// Values written when a user (re)connects an account.
#[derive(Clone)]
pub struct NewMlCredentials {
    pub user_id: UserId,
    pub ml_user_id: MlUserId,
    pub nickname: String,
    pub site: MlSite,
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: String,
    pub scopes: Vec<String>,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
}

/// Values written after a successful refresh.
#[derive(Clone)]
pub struct RotatedTokens {
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: String,
    pub scopes: Vec<String>,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}
