//! Status enums for stored MercadoLibre credentials.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a stored MercadoLibre connection.
///
/// ```text
/// active ──refresh ok──────────────▶ active
/// active ──invalid_grant / 180d────▶ reauthorization_required
/// active ──access lapsed, no retry─▶ expired
/// any    ──new authorization───────▶ active
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "ml_credential_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    /// Tokens are usable or refreshable.
    #[default]
    Active,
    /// The access token lapsed; a refresh has not succeeded yet.
    Expired,
    /// The refresh token was rejected or outlived its lifetime. The user
    /// must go through the consent flow again.
    ReauthorizationRequired,
}

impl CredentialStatus {
    /// Whether the scheduler should keep refreshing this connection.
    #[must_use]
    pub const fn is_refreshable(self) -> bool {
        matches!(self, Self::Active | Self::Expired)
    }
}

impl std::fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
            Self::ReauthorizationRequired => write!(f, "reauthorization_required"),
        }
    }
}

impl std::str::FromStr for CredentialStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "reauthorization_required" => Ok(Self::ReauthorizationRequired),
            _ => Err(format!("invalid credential status: {s}")),
        }
    }
}
