//! User domain type.

use chrono::{DateTime, Utc};
use serde::Serialize;

use mercado_lister_core::{Email, UserId};

/// A local account (tenant).
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: UserId,
    pub email: Email,
    /// Inactive users cannot log in.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
