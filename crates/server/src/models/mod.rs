//! Domain models.
//!
//! These types represent validated domain objects separate from database row types.

pub mod ml_credentials;
pub mod session;
pub mod user;

pub use ml_credentials::{MlCredentials, NewMlCredentials, RotatedTokens};
pub use session::{CurrentUser, keys as session_keys};
pub use user::User;
