//! Unified error handling with Sentry integration.
//!
//! Route handlers return `Result<T, AppError>`. Server-side failures are
//! captured to Sentry before responding; clients get a JSON body with a
//! stable `error` code and a human readable `detail`, never internals.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::db::RepositoryError;
use crate::mercadolibre::MercadoLibreError;
use crate::services::auth::AuthError;
use crate::services::ml_oauth::MlOAuthError;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] RepositoryError),

    /// Authentication operation failed.
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// MercadoLibre connection operation failed.
    #[error("MercadoLibre error: {0}")]
    MercadoLibre(#[from] MlOAuthError),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// User is not authenticated.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Bad request from client.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub detail: String,
}

impl AppError {
    /// Whether this is our fault (or upstream's) rather than the client's.
    const fn is_server_error(&self) -> bool {
        match self {
            Self::Database(_) | Self::Internal(_) => true,
            Self::Auth(err) => matches!(err, AuthError::Repository(_) | AuthError::PasswordHash),
            Self::MercadoLibre(err) => matches!(
                err,
                MlOAuthError::Crypto(_)
                    | MlOAuthError::Repository(_)
                    | MlOAuthError::MercadoLibre(
                        MercadoLibreError::Http(_)
                            | MercadoLibreError::Parse(_)
                            | MercadoLibreError::Url(_)
                            | MercadoLibreError::Api { .. }
                            | MercadoLibreError::OAuth { .. }
                    )
            ),
            Self::NotFound(_) | Self::Unauthorized(_) | Self::BadRequest(_) => false,
        }
    }

    /// HTTP status, machine readable code and client-safe detail.
    fn parts(&self) -> (StatusCode, &'static str, String) {
        const INTERNAL: &str = "Internal server error";

        match self {
            Self::Database(_) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", INTERNAL.to_string())
            }
            Self::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", what.clone()),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg.clone()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            Self::Auth(err) => match err {
                AuthError::InvalidCredentials => (
                    StatusCode::UNAUTHORIZED,
                    "invalid_credentials",
                    "Invalid credentials".to_string(),
                ),
                AuthError::UserAlreadyExists => (
                    StatusCode::CONFLICT,
                    "user_exists",
                    "An account with this email already exists".to_string(),
                ),
                AuthError::WeakPassword(msg) => {
                    (StatusCode::BAD_REQUEST, "weak_password", msg.clone())
                }
                AuthError::InvalidEmail(_) => (
                    StatusCode::BAD_REQUEST,
                    "invalid_email",
                    "Invalid email address".to_string(),
                ),
                AuthError::Repository(_) | AuthError::PasswordHash => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal", INTERNAL.to_string())
                }
            },
            Self::MercadoLibre(err) => ml_parts(err),
        }
    }
}

fn ml_parts(err: &MlOAuthError) -> (StatusCode, &'static str, String) {
    match err {
        MlOAuthError::InvalidState | MlOAuthError::StateUserMismatch => (
            StatusCode::BAD_REQUEST,
            "oauth_invalid_state",
            "Authorization expired or was already used, start again".to_string(),
        ),
        MlOAuthError::NotConnected => (
            StatusCode::CONFLICT,
            "not_connected",
            "No MercadoLibre account connected".to_string(),
        ),
        MlOAuthError::ReauthorizationRequired => (
            StatusCode::CONFLICT,
            "reauthorization_required",
            err.to_string(),
        ),
        MlOAuthError::Crypto(_) | MlOAuthError::Repository(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "Internal server error".to_string(),
        ),
        MlOAuthError::MercadoLibre(ml) => match ml {
            MercadoLibreError::CollaboratorAccount => {
                (StatusCode::FORBIDDEN, "collaborator_account", ml.to_string())
            }
            MercadoLibreError::AccountMismatch { .. } => (
                StatusCode::FORBIDDEN,
                "account_mismatch",
                "The authorized account does not match the token".to_string(),
            ),
            MercadoLibreError::InvalidGrant(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_grant",
                "Authorization code is invalid or expired".to_string(),
            ),
            MercadoLibreError::NotFound(what) => {
                (StatusCode::NOT_FOUND, "not_found", what.clone())
            }
            MercadoLibreError::RateLimited(secs) => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                format!("MercadoLibre rate limit reached, retry after {secs} seconds"),
            ),
            MercadoLibreError::Unauthorized(_) => (
                StatusCode::BAD_GATEWAY,
                "upstream_unauthorized",
                "MercadoLibre rejected the access token".to_string(),
            ),
            MercadoLibreError::Http(_)
            | MercadoLibreError::Parse(_)
            | MercadoLibreError::Url(_)
            | MercadoLibreError::Api { .. }
            | MercadoLibreError::OAuth { .. } => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "MercadoLibre request failed".to_string(),
            ),
        },
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.is_server_error() {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                sentry_event_id = %event_id,
                "Request error"
            );
        }

        let (status, error, detail) = self.parts();
        (status, Json(ErrorBody { error, detail })).into_response()
    }
}

/// Result type alias for `AppError`.
pub type Result<T> = std::result::Result<T, AppError>;

/// Set the Sentry user context for the current request.
pub fn set_sentry_user(user_id: &impl ToString, email: Option<&str>) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            email: email.map(String::from),
            ..Default::default()
        }));
    });
}

/// Clear the Sentry user context.
pub fn clear_sentry_user() {
    sentry::configure_scope(|scope| {
        scope.set_user(None);
    });
}
