//! HTTP route handlers.
//!
//! # Route Structure
//!
//! ```text
//! GET    /health                                  - Liveness
//! GET    /health/ready                            - Database connectivity
//!
//! # Auth
//! POST   /auth/register                           - Create account and log in
//! POST   /auth/login                              - Log in
//! POST   /auth/logout                             - Log out
//! GET    /auth/me                                 - Current user
//!
//! # MercadoLibre (requires auth, except the callback)
//! GET    /mercadolibre/connect                    - Redirect to MercadoLibre consent
//! GET    /mercadolibre/callback                   - OAuth redirect target
//! GET    /mercadolibre/status                     - Connection status
//! POST   /mercadolibre/refresh                    - Refresh tokens now
//! DELETE /mercadolibre/connection                 - Disconnect
//! GET    /mercadolibre/categories/predict         - Category prediction
//! GET    /mercadolibre/categories/{id}            - Category details
//! GET    /mercadolibre/categories/{id}/attributes - Category attributes
//! ```

pub mod auth;
pub mod mercadolibre;

use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::state::AppState;

/// Create the auth routes router.
pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me))
}

/// Create the MercadoLibre routes router.
pub fn mercadolibre_routes() -> Router<AppState> {
    Router::new()
        .route("/connect", get(mercadolibre::connect))
        .route("/callback", get(mercadolibre::callback))
        .route("/status", get(mercadolibre::status))
        .route("/refresh", post(mercadolibre::refresh))
        .route("/connection", delete(mercadolibre::disconnect))
        .route("/categories/predict", get(mercadolibre::predict_category))
        .route("/categories/{id}", get(mercadolibre::category))
        .route(
            "/categories/{id}/attributes",
            get(mercadolibre::category_attributes),
        )
}

/// Create all application routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/auth", auth_routes())
        .nest("/mercadolibre", mercadolibre_routes())
}
