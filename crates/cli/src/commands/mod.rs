//! CLI subcommands.

pub mod credentials;
pub mod migrate;
pub mod user;

use secrecy::SecretString;
use sqlx::PgPool;

/// Errors shared by commands that only need the database.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseSetupError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("Database connection error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Connect using `DATABASE_URL` (loading `.env` first).
pub async fn connect() -> Result<PgPool, DatabaseSetupError> {
    dotenvy::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL")
        .map(SecretString::from)
        .map_err(|_| DatabaseSetupError::MissingEnvVar("DATABASE_URL"))?;

    tracing::info!("Connecting to database...");
    Ok(mercado_lister_server::db::create_pool(&database_url).await?)
}
