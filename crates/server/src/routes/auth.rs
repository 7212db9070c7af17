//! Local account route handlers.

use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;
use tower_sessions::Session;

use crate::error::{AppError, Result, clear_sentry_user, set_sentry_user};
use crate::middleware::{RequireAuth, clear_current_user, set_current_user};
use crate::models::{CurrentUser, User};
use crate::services::AuthService;
use crate::state::AppState;

/// Login and registration body. No `Debug`: it carries the password.
#[derive(Deserialize)]
pub struct CredentialsForm {
    pub email: String,
    pub password: String,
}

async fn log_in(session: &Session, user: &User) -> Result<CurrentUser> {
    let current = CurrentUser {
        id: user.id,
        email: user.email.clone(),
    };
    set_current_user(session, &current)
        .await
        .map_err(|e| AppError::Internal(format!("session error: {e}")))?;
    set_sentry_user(&current.id, Some(current.email.as_str()));
    Ok(current)
}

/// Create an account and log in.
///
/// # Route
///
/// `POST /auth/register`
pub async fn register(
    State(state): State<AppState>,
    session: Session,
    Json(form): Json<CredentialsForm>,
) -> Result<(StatusCode, Json<CurrentUser>)> {
    let user = AuthService::new(state.pool())
        .register(&form.email, &form.password)
        .await?;
    tracing::info!(user_id = %user.id, "User registered");

    let current = log_in(&session, &user).await?;
    Ok((StatusCode::CREATED, Json(current)))
}

/// Log in with email and password.
///
/// # Route
///
/// `POST /auth/login`
pub async fn login(
    State(state): State<AppState>,
    session: Session,
    Json(form): Json<CredentialsForm>,
) -> Result<Json<CurrentUser>> {
    let user = AuthService::new(state.pool())
        .login(&form.email, &form.password)
        .await?;
    Ok(Json(log_in(&session, &user).await?))
}

/// End the session.
///
/// # Route
///
/// `POST /auth/logout`
pub async fn logout(session: Session) -> Result<StatusCode> {
    clear_current_user(&session)
        .await
        .map_err(|e| AppError::Internal(format!("session error: {e}")))?;
    clear_sentry_user();
    Ok(StatusCode::NO_CONTENT)
}

/// The logged-in user.
///
/// # Route
///
/// `GET /auth/me`
pub async fn me(RequireAuth(user): RequireAuth) -> Json<CurrentUser> {
    Json(user)
}
