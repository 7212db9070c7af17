//! Local user management commands.
//!
//! # Usage
//!
//! ```bash
//! ml-cli user create -e seller@example.com
//! ML_CLI_PASSWORD=... ml-cli user set-password -e seller@example.com
//! ```
//!
//! # Environment Variables
//!
//! - `DATABASE_URL` - `PostgreSQL` connection string
//! - `ML_CLI_PASSWORD` - Password to set; read from stdin when unset

use std::io::BufRead;

use mercado_lister_core::UserId;
use mercado_lister_server::services::{AuthError, AuthService};
use secrecy::{ExposeSecret, SecretString};

use super::{DatabaseSetupError, connect};

const PASSWORD_ENV: &str = "ML_CLI_PASSWORD";

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error(transparent)]
    Setup(#[from] DatabaseSetupError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Could not read password: {0}")]
    Io(#[from] std::io::Error),

    #[error("No password given on stdin or in {PASSWORD_ENV}")]
    MissingPassword,
}

/// Create a user. Returns its id.
pub async fn create(email: &str) -> Result<UserId, UserError> {
    let password = read_password()?;
    let pool = connect().await?;

    let user = AuthService::new(&pool)
        .register(email, password.expose_secret())
        .await?;

    tracing::info!("User created! ID: {}, Email: {}", user.id, user.email);
    Ok(user.id)
}

/// Replace a user's password.
pub async fn set_password(email: &str) -> Result<(), UserError> {
    let password = read_password()?;
    let pool = connect().await?;

    AuthService::new(&pool)
        .set_password(email, password.expose_secret())
        .await?;

    tracing::info!("Password updated for {}", email);
    Ok(())
}

fn read_password() -> Result<SecretString, UserError> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(SecretString::from(password));
    }

    tracing::info!("Reading password from stdin");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        return Err(UserError::MissingPassword);
    }
    Ok(SecretString::from(password.to_string()))
}
