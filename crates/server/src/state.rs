//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::AppConfig;
use crate::crypto::{CryptoError, TokenCipher};
use crate::db::MlCredentialsRepository;
use crate::mercadolibre::MercadoLibreError;
use crate::services::MlOAuthService;

/// Error building the application state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("token encryption key: {0}")]
    Cipher(#[from] CryptoError),
    #[error("MercadoLibre client: {0}")]
    MercadoLibre(#[from] MercadoLibreError),
}

/// Connection service backed by `PostgreSQL`.
pub type MercadoLibreService = MlOAuthService<MlCredentialsRepository>;

/// Application state shared across all handlers.
///
/// Cheaply cloneable via `Arc`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    pool: PgPool,
    mercadolibre: MercadoLibreService,
}

impl AppState {
    /// Create a new application state.
    ///
    /// # Errors
    ///
    /// Returns an error if the encryption key is unusable or the HTTP client
    /// cannot be built.
    pub fn new(config: AppConfig, pool: PgPool) -> Result<Self, StateError> {
        let cipher = TokenCipher::from_base64_key(&config.token_encryption_key)?;
        let mercadolibre = MlOAuthService::new(
            MlCredentialsRepository::new(pool.clone()),
            &config.mercadolibre,
            cipher,
        )?;

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                pool,
                mercadolibre,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    /// MercadoLibre connection service.
    #[must_use]
    pub fn mercadolibre(&self) -> &MercadoLibreService {
        &self.inner.mercadolibre
    }
}
