//! MercadoLibre credential maintenance.
//!
//! # Usage
//!
//! ```bash
//! ml-cli credentials sweep
//! ml-cli credentials sweep --window-secs 7200
//! ```
//!
//! Needs the same environment as the server (`DATABASE_URL`,
//! `TOKEN_ENCRYPTION_KEY`, `ML_CLIENT_ID`, `ML_CLIENT_SECRET`, ...).

use std::time::Duration;

use mercado_lister_server::config::{AppConfig, ConfigError};
use mercado_lister_server::crypto::{CryptoError, TokenCipher};
use mercado_lister_server::db::{self, MlCredentialsRepository};
use mercado_lister_server::mercadolibre::MercadoLibreError;
use mercado_lister_server::services::{MlOAuthError, MlOAuthService, RefreshScheduler, SweepReport};

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database connection error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Token encryption key: {0}")]
    Cipher(#[from] CryptoError),

    #[error("MercadoLibre client: {0}")]
    Client(#[from] MercadoLibreError),

    #[error("Sweep failed: {0}")]
    Sweep(#[from] MlOAuthError),

    #[error("Could not print report: {0}")]
    Report(#[from] serde_json::Error),
}

/// Run one refresh sweep and print its report as JSON.
pub async fn sweep(window_secs: Option<u64>) -> Result<SweepReport, CredentialsError> {
    let mut config = AppConfig::from_env()?;
    if let Some(secs) = window_secs {
        config.refresh.window = Duration::from_secs(secs);
    }

    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url).await?;

    let cipher = TokenCipher::from_base64_key(&config.token_encryption_key)?;
    let service = MlOAuthService::new(
        MlCredentialsRepository::new(pool),
        &config.mercadolibre,
        cipher,
    )?;

    let report = RefreshScheduler::new(service, config.refresh).sweep().await?;

    #[allow(clippy::print_stdout)]
    {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(report)
}
