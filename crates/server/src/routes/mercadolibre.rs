//! MercadoLibre connection and category route handlers.
//!
//! The browser is sent to MercadoLibre from `connect` and comes back through
//! `callback`, which always redirects to the frontend settings page with
//! either `success=connected` or an `error` code.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::mercadolibre::{Category, CategoryAttribute, CategoryPrediction, MercadoLibreError};
use crate::middleware::{OptionalAuth, RequireAuth};
use crate::services::{ConnectionDetails, ConnectionStatus, MlOAuthError};
use crate::state::AppState;

/// Error MercadoLibre reports when a collaborator tries to authorize.
const COLLABORATOR_ERROR: &str = "invalid_operator_user_id";

const DEFAULT_PREDICTIONS: u8 = 3;
const MAX_CATEGORY_ID_LEN: usize = 32;

/// Result of an OAuth callback, as shown to the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Connected,
    Denied,
    InvalidState,
    Failed,
    ExchangeFailed,
    CollaboratorAccount,
    SaveFailed,
}

impl CallbackOutcome {
    /// Query string appended to the settings page URL.
    #[must_use]
    pub const fn query(self) -> &'static str {
        match self {
            Self::Connected => "success=connected",
            Self::Denied => "error=oauth_denied",
            Self::InvalidState => "error=oauth_invalid_state",
            Self::Failed => "error=oauth_failed",
            Self::ExchangeFailed => "error=oauth_exchange_failed",
            Self::CollaboratorAccount => "error=collaborator_account",
            Self::SaveFailed => "error=oauth_save_failed",
        }
    }

    #[must_use]
    pub const fn from_error(err: &MlOAuthError) -> Self {
        match err {
            MlOAuthError::InvalidState | MlOAuthError::StateUserMismatch => Self::InvalidState,
            MlOAuthError::MercadoLibre(MercadoLibreError::CollaboratorAccount) => {
                Self::CollaboratorAccount
            }
            MlOAuthError::MercadoLibre(MercadoLibreError::AccountMismatch { .. })
            | MlOAuthError::NotConnected
            | MlOAuthError::ReauthorizationRequired => Self::Failed,
            MlOAuthError::MercadoLibre(_) => Self::ExchangeFailed,
            MlOAuthError::Crypto(_) | MlOAuthError::Repository(_) => Self::SaveFailed,
        }
    }

    fn redirect(self, settings_url: &str) -> Response {
        found(&format!("{settings_url}?{}", self.query()))
    }
}

/// `302 Found` to `location`.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// `json` returns the authorization URL instead of redirecting.
    pub format: Option<String>,
}

/// Start connecting a MercadoLibre account.
///
/// # Route
///
/// `GET /mercadolibre/connect`
pub async fn connect(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
    Query(query): Query<ConnectQuery>,
) -> Result<Response> {
    let request = state.mercadolibre().start_authorization(user.id).await?;

    if query.format.as_deref() == Some("json") {
        return Ok(Json(request).into_response());
    }
    Ok(found(&request.authorization_url))
}

/// Query parameters of the OAuth redirect.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// OAuth redirect target.
///
/// The callback must arrive in the session of the user who started the flow.
///
/// # Route
///
/// `GET /mercadolibre/callback`
pub async fn callback(
    State(state): State<AppState>,
    OptionalAuth(user): OptionalAuth,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let settings_url = state.config().settings_url();

    if let Some(error) = query.error {
        let description = query.error_description.unwrap_or_default();
        tracing::warn!(error = %error, description = %description, "MercadoLibre OAuth error");
        let outcome = if error == COLLABORATOR_ERROR {
            CallbackOutcome::CollaboratorAccount
        } else {
            CallbackOutcome::Denied
        };
        return outcome.redirect(&settings_url);
    }

    let Some(user) = user else {
        tracing::warn!("MercadoLibre OAuth callback without a session");
        return CallbackOutcome::InvalidState.redirect(&settings_url);
    };

    let (Some(code), Some(oauth_state)) = (query.code, query.state) else {
        tracing::warn!(user_id = %user.id, "MercadoLibre OAuth callback missing code or state");
        return CallbackOutcome::Failed.redirect(&settings_url);
    };

    match state
        .mercadolibre()
        .complete_authorization(user.id, &oauth_state, &code)
        .await
    {
        Ok(_) => CallbackOutcome::Connected.redirect(&settings_url),
        Err(e) => {
            let outcome = CallbackOutcome::from_error(&e);
            if outcome == CallbackOutcome::SaveFailed {
                let event_id = sentry::capture_error(&e);
                tracing::error!(
                    user_id = %user.id,
                    error = %e,
                    sentry_event_id = %event_id,
                    "Failed to store MercadoLibre credentials"
                );
            } else {
                tracing::warn!(user_id = %user.id, error = %e, "MercadoLibre OAuth callback failed");
            }
            outcome.redirect(&settings_url)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub validate: bool,
}

/// Connection status.
///
/// # Route
///
/// `GET /mercadolibre/status[?validate=true]`
pub async fn status(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
    Query(query): Query<StatusQuery>,
) -> Result<Json<ConnectionStatus>> {
    let status = state
        .mercadolibre()
        .connection_status(user.id, query.validate)
        .await?;
    Ok(Json(status))
}

/// Refresh tokens now.
///
/// # Route
///
/// `POST /mercadolibre/refresh`
pub async fn refresh(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
) -> Result<Json<ConnectionDetails>> {
    let creds = state.mercadolibre().refresh(user.id).await?;
    Ok(Json(ConnectionDetails::from(&creds)))
}

/// Forget the connected account.
///
/// # Route
///
/// `DELETE /mercadolibre/connection`
pub async fn disconnect(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
) -> Result<StatusCode> {
    if state.mercadolibre().disconnect(user.id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(
            "No MercadoLibre account connected".to_string(),
        ))
    }
}

/// Category ids are a site prefix plus digits, e.g. `MLA1055`.
fn validate_category_id(id: &str) -> Result<&str> {
    if !id.is_empty()
        && id.len() <= MAX_CATEGORY_ID_LEN
        && id.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        Ok(id)
    } else {
        Err(AppError::BadRequest(format!("invalid category id: {id:?}")))
    }
}

#[derive(Debug, Deserialize)]
pub struct PredictQuery {
    pub q: String,
    pub limit: Option<u8>,
}

/// Suggest categories for a product title.
///
/// # Route
///
/// `GET /mercadolibre/categories/predict?q=`
pub async fn predict_category(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
    Query(query): Query<PredictQuery>,
) -> Result<Json<Vec<CategoryPrediction>>> {
    let title = query.q.trim();
    if title.is_empty() {
        return Err(AppError::BadRequest("q must not be empty".to_string()));
    }
    let limit = query.limit.unwrap_or(DEFAULT_PREDICTIONS);

    let service = state.mercadolibre();
    let site = service.connected_site(user.id).await?;
    let api = service.api();
    let predictions = service
        .with_access_token(user.id, |token| async move {
            api.predict_category(&token, site, title, limit).await
        })
        .await?;
    Ok(Json(predictions))
}

/// Category details.
///
/// # Route
///
/// `GET /mercadolibre/categories/{id}`
pub async fn category(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
    Path(category_id): Path<String>,
) -> Result<Json<Category>> {
    let id = validate_category_id(&category_id)?;
    let service = state.mercadolibre();
    let api = service.api();
    let category = service
        .with_access_token(user.id, |token| async move { api.category(&token, id).await })
        .await?;
    Ok(Json(category))
}

/// Attributes a listing in the category can carry.
///
/// # Route
///
/// `GET /mercadolibre/categories/{id}/attributes`
pub async fn category_attributes(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
    Path(category_id): Path<String>,
) -> Result<Json<Vec<CategoryAttribute>>> {
    let id = validate_category_id(&category_id)?;
    let service = state.mercadolibre();
    let api = service.api();
    let attributes = service
        .with_access_token(user.id, |token| async move {
            api.category_attributes(&token, id).await
        })
        .await?;
    Ok(Json(attributes))
}
