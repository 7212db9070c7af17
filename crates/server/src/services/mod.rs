//! Business logic services.
//!
//! # Services
//!
//! - `auth` - Local email/password accounts
//! - `oauth_state` - Pending MercadoLibre authorizations (state + PKCE verifier)
//! - `ml_oauth` - MercadoLibre connection lifecycle and token refresh
//! - `refresh_scheduler` - Background refresh of expiring tokens

pub mod auth;
pub mod ml_oauth;
pub mod oauth_state;
pub mod refresh_scheduler;

pub use auth::{AuthError, AuthService};
pub use ml_oauth::{
    AuthorizationRequest, ConnectionDetails, ConnectionStatus, MlOAuthError, MlOAuthService,
    RefreshOutcome,
};
pub use oauth_state::{OAuthStateStore, PendingAuthorization};
pub use refresh_scheduler::{RefreshScheduler, SweepReport};
