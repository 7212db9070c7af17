//! MercadoLibre connection lifecycle.
//!
//! Starts and completes the PKCE authorization flow, hands out valid access
//! tokens, refreshes them before they lapse and reports connection status.
//!
//! Refresh tokens are single use. All refreshes for a user run under a
//! per-user lock and re-read the stored row after acquiring it, so two
//! concurrent callers never spend the same refresh token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use secrecy::SecretString;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use mercado_lister_core::{CredentialStatus, MlSite, MlUserId, UserId};

use crate::config::MercadoLibreConfig;
use crate::crypto::{CryptoError, TokenCipher};
use crate::db::ml_credentials::REFRESH_TOKEN_LAPSED;
use crate::db::{CredentialStore, RepositoryError};
use crate::mercadolibre::{
    MercadoLibreClient, MercadoLibreError, MlToken, OAuthClient, Transport, account,
};
use crate::models::{MlCredentials, NewMlCredentials, RotatedTokens};
use crate::services::oauth_state::OAuthStateStore;

/// Access tokens closer than this to expiry are refreshed before use.
pub const ACCESS_TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

const PERSIST_ATTEMPTS: u32 = 3;
const LOCK_IDLE: Duration = Duration::from_secs(3600);

/// Errors from the connection lifecycle.
#[derive(Debug, Error)]
pub enum MlOAuthError {
    /// The callback `state` was never issued, already used or expired.
    #[error("invalid or expired OAuth state")]
    InvalidState,

    /// The callback arrived in a different user's session.
    #[error("OAuth state belongs to a different user")]
    StateUserMismatch,

    #[error("no MercadoLibre account connected")]
    NotConnected,

    /// The stored grant is dead; the user must connect again.
    #[error("MercadoLibre authorization expired, reconnect the account")]
    ReauthorizationRequired,

    #[error(transparent)]
    MercadoLibre(#[from] MercadoLibreError),

    #[error("token encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("database error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Where to send the browser to start an authorization.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    pub authorization_url: String,
    pub state: String,
    /// Seconds until the `state` value expires.
    pub expires_in: u64,
}

/// Public view of a stored connection. Never carries tokens.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDetails {
    pub ml_user_id: MlUserId,
    pub nickname: String,
    pub site: MlSite,
    pub status: CredentialStatus,
    pub scopes: Vec<String>,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl From<&MlCredentials> for ConnectionDetails {
    fn from(creds: &MlCredentials) -> Self {
        Self {
            ml_user_id: creds.ml_user_id,
            nickname: creds.nickname.clone(),
            site: creds.site,
            status: creds.status,
            scopes: creds.scopes.clone(),
            access_token_expires_at: creds.access_token_expires_at,
            refresh_token_expires_at: creds.refresh_token_expires_at,
            last_refreshed_at: creds.last_refreshed_at,
            last_validated_at: creds.last_validated_at,
            last_error: creds.last_error.clone(),
            connected_at: creds.created_at,
        }
    }
}

/// Connection state as reported to the frontend.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "connection", rename_all = "snake_case")]
pub enum ConnectionStatus {
    NotConnected,
    Connected(ConnectionDetails),
    ReauthorizationRequired(ConnectionDetails),
}

impl ConnectionStatus {
    fn from_credentials(creds: &MlCredentials) -> Self {
        if creds.status == CredentialStatus::ReauthorizationRequired {
            Self::ReauthorizationRequired(creds.into())
        } else {
            Self::Connected(creds.into())
        }
    }
}

/// What caused a refresh attempt.
#[derive(Debug, Clone, Copy)]
enum RefreshTrigger<'a> {
    /// Refresh unconditionally.
    Forced,
    /// Refresh only if the access token expires within the window.
    ExpiringWithin(Duration),
    /// The API rejected this (encrypted) access token. Skip if it was
    /// already replaced.
    Rejected(&'a str),
}

/// Result of a conditional refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    NotDue,
}

/// MercadoLibre connection service.
pub struct MlOAuthService<S> {
    inner: Arc<MlOAuthServiceInner<S>>,
}

impl<S> Clone for MlOAuthService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct MlOAuthServiceInner<S> {
    store: S,
    oauth: OAuthClient,
    api: MercadoLibreClient,
    cipher: TokenCipher,
    states: OAuthStateStore,
    site: MlSite,
    refresh_locks: Cache<UserId, Arc<Mutex<()>>>,
}

impl<S: CredentialStore> MlOAuthService<S> {
    /// Build the service and its HTTP clients from configuration.
    ///
    /// # Errors
    ///
    /// Returns `MercadoLibreError::Http` if the HTTP client cannot be built.
    pub fn new(
        store: S,
        config: &MercadoLibreConfig,
        cipher: TokenCipher,
    ) -> Result<Self, MercadoLibreError> {
        let transport = Transport::new(config)?;
        Ok(Self {
            inner: Arc::new(MlOAuthServiceInner {
                store,
                oauth: OAuthClient::new(config, transport.clone()),
                api: MercadoLibreClient::new(config, transport),
                cipher,
                states: OAuthStateStore::new(config.oauth_state_ttl),
                site: config.site,
                refresh_locks: Cache::builder().time_to_idle(LOCK_IDLE).build(),
            }),
        })
    }

    /// API client for calls made on behalf of a user.
    #[must_use]
    pub fn api(&self) -> &MercadoLibreClient {
        &self.inner.api
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    // =========================================================================
    // Authorization flow
    // =========================================================================

    /// Begin connecting an account for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns `MercadoLibreError::Url` if the auth host is misconfigured.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn start_authorization(
        &self,
        user_id: UserId,
    ) -> Result<AuthorizationRequest, MlOAuthError> {
        let oauth = &self.inner.oauth;
        let (state, pending) = self.inner.states.start(user_id, oauth.redirect_uri()).await;
        let authorization_url = oauth.authorization_url(
            &state,
            &pending.verifier.challenge(),
            &pending.redirect_uri,
        )?;

        debug!("MercadoLibre authorization started");
        Ok(AuthorizationRequest {
            authorization_url,
            state,
            expires_in: self.inner.states.ttl().as_secs(),
        })
    }

    /// Finish the flow with the `state` and `code` from the callback.
    ///
    /// Only the manager account of a seller can be connected. Reconnecting
    /// replaces the stored tokens and makes the connection active again.
    ///
    /// # Errors
    ///
    /// Returns `MlOAuthError::InvalidState` or `MlOAuthError::StateUserMismatch`
    /// for a forged, replayed or expired callback.
    /// Returns `MercadoLibreError::CollaboratorAccount` (wrapped) if a
    /// collaborator account authorized.
    #[instrument(skip(self, state, code), fields(user_id = %user_id))]
    pub async fn complete_authorization(
        &self,
        user_id: UserId,
        state: &str,
        code: &str,
    ) -> Result<MlCredentials, MlOAuthError> {
        let pending = self
            .inner
            .states
            .take(state)
            .await
            .ok_or(MlOAuthError::InvalidState)?;
        if pending.user_id != user_id {
            warn!(
                issued_to = %pending.user_id,
                "OAuth callback state issued to another user, possible CSRF"
            );
            return Err(MlOAuthError::StateUserMismatch);
        }

        let token = self
            .inner
            .oauth
            .exchange_code(code, &pending.verifier, &pending.redirect_uri)
            .await?;
        let profile = self.inner.api.users_me(&token.access_token).await?;
        account::ensure_manager(&profile, token.ml_user_id)?;

        let site = profile
            .site_id
            .as_deref()
            .and_then(|s| s.parse::<MlSite>().ok())
            .unwrap_or(self.inner.site);

        let new = NewMlCredentials {
            user_id,
            ml_user_id: token.ml_user_id,
            nickname: profile.nickname,
            site,
            access_token_encrypted: self.inner.cipher.encrypt(&token.access_token)?,
            refresh_token_encrypted: self.inner.cipher.encrypt(&token.refresh_token)?,
            scopes: token.scopes,
            access_token_expires_at: token.access_token_expires_at,
            refresh_token_expires_at: token.refresh_token_expires_at,
        };

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        let saved = self.inner.store.upsert(&new).await?;

        info!(
            ml_user_id = %saved.ml_user_id,
            nickname = %saved.nickname,
            site = %saved.site,
            "MercadoLibre account connected"
        );
        Ok(saved)
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    /// A usable access token for `user_id`, refreshing it first if it expires
    /// within five minutes.
    ///
    /// # Errors
    ///
    /// Returns `MlOAuthError::NotConnected` if the user has no connection and
    /// `MlOAuthError::ReauthorizationRequired` if the grant is dead.
    pub async fn valid_access_token(&self, user_id: UserId) -> Result<SecretString, MlOAuthError> {
        let (token, _) = self.access_token_with_ciphertext(user_id).await?;
        Ok(token)
    }

    /// Refresh the user's tokens now.
    ///
    /// # Errors
    ///
    /// Returns `MlOAuthError::ReauthorizationRequired` if MercadoLibre rejects
    /// the refresh token or it outlived its lifetime.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn refresh(&self, user_id: UserId) -> Result<MlCredentials, MlOAuthError> {
        let (creds, _) = self.refresh_locked(user_id, RefreshTrigger::Forced).await?;
        Ok(creds)
    }

    /// Refresh only if the access token expires within `window`.
    ///
    /// # Errors
    ///
    /// Same as [`MlOAuthService::refresh`].
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn refresh_if_due(
        &self,
        user_id: UserId,
        window: Duration,
    ) -> Result<RefreshOutcome, MlOAuthError> {
        let (_, outcome) = self
            .refresh_locked(user_id, RefreshTrigger::ExpiringWithin(window))
            .await?;
        Ok(outcome)
    }

    /// Run an API call with the user's token. If the token is rejected, the
    /// tokens are refreshed once and the call is repeated.
    ///
    /// # Errors
    ///
    /// Returns `MlOAuthError::ReauthorizationRequired` if the token is still
    /// rejected after a refresh, or any error of the call itself.
    pub async fn with_access_token<T, F, Fut>(
        &self,
        user_id: UserId,
        call: F,
    ) -> Result<T, MlOAuthError>
    where
        F: Fn(SecretString) -> Fut,
        Fut: Future<Output = Result<T, MercadoLibreError>>,
    {
        let (token, ciphertext) = self.access_token_with_ciphertext(user_id).await?;
        match call(token).await {
            Err(MercadoLibreError::Unauthorized(reason)) => {
                debug!(user_id = %user_id, reason = %reason, "Access token rejected, refreshing");
                self.refresh_locked(user_id, RefreshTrigger::Rejected(&ciphertext))
                    .await?;
                let (token, _) = self.access_token_with_ciphertext(user_id).await?;
                match call(token).await {
                    Err(MercadoLibreError::Unauthorized(reason)) => {
                        warn!(
                            user_id = %user_id,
                            reason = %reason,
                            "Refreshed access token rejected, marking for reauthorization"
                        );
                        self.inner
                            .store
                            .set_status(
                                user_id,
                                CredentialStatus::ReauthorizationRequired,
                                Some(&reason),
                            )
                            .await?;
                        Err(MlOAuthError::ReauthorizationRequired)
                    }
                    other => other.map_err(MlOAuthError::from),
                }
            }
            other => other.map_err(MlOAuthError::from),
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Connection state of `user_id`.
    ///
    /// With `validate`, the token is checked against `/users/me` (refreshing
    /// once on rejection) and the validation time is recorded.
    ///
    /// # Errors
    ///
    /// Returns transport and database errors. A dead grant is reported as
    /// `ConnectionStatus::ReauthorizationRequired`, not as an error.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn connection_status(
        &self,
        user_id: UserId,
        validate: bool,
    ) -> Result<ConnectionStatus, MlOAuthError> {
        let Some(creds) = self.inner.store.find_by_user(user_id).await? else {
            return Ok(ConnectionStatus::NotConnected);
        };
        if !validate || creds.status == CredentialStatus::ReauthorizationRequired {
            return Ok(ConnectionStatus::from_credentials(&creds));
        }

        let api = self.inner.api.clone();
        let result = self
            .with_access_token(user_id, |token| {
                let api = api.clone();
                async move { api.users_me(&token).await }
            })
            .await;

        match result {
            Ok(profile) => {
                if profile.id != creds.ml_user_id.get() {
                    warn!(
                        expected = %creds.ml_user_id,
                        actual = profile.id,
                        "Validated token belongs to a different MercadoLibre account"
                    );
                }
                self.inner.store.mark_validated(user_id, Utc::now()).await?;
            }
            Err(MlOAuthError::ReauthorizationRequired | MlOAuthError::NotConnected) => {}
            Err(e) => return Err(e),
        }

        Ok(self
            .inner
            .store
            .find_by_user(user_id)
            .await?
            .map_or(ConnectionStatus::NotConnected, |c| {
                ConnectionStatus::from_credentials(&c)
            }))
    }

    /// Site of the user's connected account. Site-scoped API calls use this,
    /// not the configured default.
    ///
    /// # Errors
    ///
    /// Returns `MlOAuthError::NotConnected` if the user has no connection.
    pub async fn connected_site(&self, user_id: UserId) -> Result<MlSite, MlOAuthError> {
        self.inner
            .store
            .find_by_user(user_id)
            .await?
            .map(|creds| creds.site)
            .ok_or(MlOAuthError::NotConnected)
    }

    /// Forget the user's connection. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns `MlOAuthError::Repository` if the delete fails.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn disconnect(&self, user_id: UserId) -> Result<bool, MlOAuthError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        let removed = self.inner.store.delete(user_id).await?;
        if removed {
            info!("MercadoLibre account disconnected");
        }
        Ok(removed)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Flag connections whose refresh token outlived its lifetime.
    ///
    /// # Errors
    ///
    /// Returns `MlOAuthError::Repository` if the update fails.
    pub async fn expire_lapsed_refresh_tokens(&self) -> Result<u64, MlOAuthError> {
        Ok(self
            .inner
            .store
            .expire_lapsed_refresh_tokens(Utc::now())
            .await?)
    }

    /// Connections whose access token expires within `window`.
    ///
    /// # Errors
    ///
    /// Returns `MlOAuthError::Repository` if the query fails.
    pub async fn due_for_refresh(
        &self,
        window: Duration,
        limit: i64,
    ) -> Result<Vec<MlCredentials>, MlOAuthError> {
        let before = Utc::now() + chrono_duration(window);
        Ok(self.inner.store.list_due_for_refresh(before, limit).await?)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn user_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.inner
            .refresh_locks
            .get_with(user_id, async { Arc::new(Mutex::new(())) })
            .await
    }

    /// Access token plus the stored ciphertext it came from.
    async fn access_token_with_ciphertext(
        &self,
        user_id: UserId,
    ) -> Result<(SecretString, String), MlOAuthError> {
        let creds = self
            .inner
            .store
            .find_by_user(user_id)
            .await?
            .ok_or(MlOAuthError::NotConnected)?;
        if creds.status == CredentialStatus::ReauthorizationRequired {
            return Err(MlOAuthError::ReauthorizationRequired);
        }

        let creds = if creds
            .access_expires_within(chrono_duration(ACCESS_TOKEN_REFRESH_MARGIN), Utc::now())
        {
            self.refresh_locked(
                user_id,
                RefreshTrigger::ExpiringWithin(ACCESS_TOKEN_REFRESH_MARGIN),
            )
            .await?
            .0
        } else {
            creds
        };

        let token = self.inner.cipher.decrypt(&creds.access_token_encrypted)?;
        Ok((token, creds.access_token_encrypted))
    }

    async fn refresh_locked(
        &self,
        user_id: UserId,
        trigger: RefreshTrigger<'_>,
    ) -> Result<(MlCredentials, RefreshOutcome), MlOAuthError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        // Re-read under the lock: another task may have refreshed already.
        let creds = self
            .inner
            .store
            .find_by_user(user_id)
            .await?
            .ok_or(MlOAuthError::NotConnected)?;
        if creds.status == CredentialStatus::ReauthorizationRequired {
            return Err(MlOAuthError::ReauthorizationRequired);
        }

        let now = Utc::now();
        let due = match trigger {
            RefreshTrigger::Forced => true,
            RefreshTrigger::ExpiringWithin(window) => {
                creds.access_expires_within(chrono_duration(window), now)
            }
            RefreshTrigger::Rejected(ciphertext) => creds.access_token_encrypted == ciphertext,
        };
        if !due {
            return Ok((creds, RefreshOutcome::NotDue));
        }

        if creds.refresh_token_expired(now) {
            warn!(user_id = %user_id, "MercadoLibre refresh token lapsed");
            self.inner
                .store
                .set_status(
                    user_id,
                    CredentialStatus::ReauthorizationRequired,
                    Some(REFRESH_TOKEN_LAPSED),
                )
                .await?;
            return Err(MlOAuthError::ReauthorizationRequired);
        }

        let refresh_token = self.inner.cipher.decrypt(&creds.refresh_token_encrypted)?;
        match self.inner.oauth.refresh(&refresh_token).await {
            Ok(token) => {
                let updated = self.store_rotated(&creds, token, now).await?;
                info!(
                    user_id = %user_id,
                    ml_user_id = %updated.ml_user_id,
                    expires_at = %updated.access_token_expires_at,
                    "MercadoLibre tokens refreshed"
                );
                Ok((updated, RefreshOutcome::Refreshed))
            }
            Err(e) if e.requires_reauthorization() => {
                warn!(user_id = %user_id, error = %e, "MercadoLibre refresh token rejected");
                self.inner
                    .store
                    .set_status(
                        user_id,
                        CredentialStatus::ReauthorizationRequired,
                        Some(&e.to_string()),
                    )
                    .await?;
                Err(MlOAuthError::ReauthorizationRequired)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(user_id = %user_id, error = %message, "MercadoLibre token refresh failed");
                if creds.access_token_expires_at <= now {
                    self.inner
                        .store
                        .set_status(user_id, CredentialStatus::Expired, Some(&message))
                        .await?;
                } else {
                    self.inner.store.record_error(user_id, &message).await?;
                }
                Err(e.into())
            }
        }
    }

    /// Persist a rotated pair. The old refresh token is already spent, so
    /// transient database failures are retried before giving up.
    async fn store_rotated(
        &self,
        creds: &MlCredentials,
        token: MlToken,
        now: DateTime<Utc>,
    ) -> Result<MlCredentials, MlOAuthError> {
        if token.ml_user_id != creds.ml_user_id {
            let err = MercadoLibreError::AccountMismatch {
                expected: creds.ml_user_id.get(),
                actual: token.ml_user_id.get(),
            };
            self.inner
                .store
                .set_status(
                    creds.user_id,
                    CredentialStatus::ReauthorizationRequired,
                    Some(&err.to_string()),
                )
                .await?;
            return Err(err.into());
        }

        let scopes = if token.scopes.is_empty() {
            creds.scopes.clone()
        } else {
            token.scopes
        };
        let rotated = RotatedTokens {
            access_token_encrypted: self.inner.cipher.encrypt(&token.access_token)?,
            refresh_token_encrypted: self.inner.cipher.encrypt(&token.refresh_token)?,
            scopes,
            access_token_expires_at: token.access_token_expires_at,
            refresh_token_expires_at: token.refresh_token_expires_at,
            refreshed_at: now,
        };

        let mut attempt = 1;
        loop {
            match self.inner.store.update_tokens(creds.user_id, &rotated).await {
                Ok(updated) => return Ok(updated),
                Err(RepositoryError::Database(e)) if attempt < PERSIST_ATTEMPTS => {
                    let backoff = Duration::from_millis(100 * 2_u64.pow(attempt));
                    warn!(
                        user_id = %creds.user_id,
                        attempt,
                        error = %e,
                        "Storing rotated MercadoLibre tokens failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        user_id = %creds.user_id,
                        error = %e,
                        "Rotated MercadoLibre tokens could not be stored"
                    );
                    return Err(e.into());
                }
            }
        }
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
