//! MercadoLibre credentials storage.
//!
//! [`CredentialStore`] is the persistence seam of the OAuth service. The
//! `PostgreSQL` implementation lives here; an in-memory one for tests and
//! tooling lives in [`super::memory`].

use std::future::Future;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use mercado_lister_core::{CredentialStatus, MlCredentialsId, MlSite, MlUserId, UserId};

use super::RepositoryError;
use crate::models::{MlCredentials, NewMlCredentials, RotatedTokens};

/// Persistence operations the OAuth service needs.
///
/// Every method is keyed by the local user: each user owns at most one
/// connection.
pub trait CredentialStore: Send + Sync + 'static {
    /// The user's connection, if any.
    fn find_by_user(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Option<MlCredentials>, RepositoryError>> + Send;

    /// Insert or replace the user's connection. Status becomes `active` and
    /// previous errors are cleared.
    fn upsert(
        &self,
        new: &NewMlCredentials,
    ) -> impl Future<Output = Result<MlCredentials, RepositoryError>> + Send;

    /// Store a rotated token pair. Status becomes `active`.
    ///
    /// Returns `RepositoryError::NotFound` if the user disconnected meanwhile.
    fn update_tokens(
        &self,
        user_id: UserId,
        tokens: &RotatedTokens,
    ) -> impl Future<Output = Result<MlCredentials, RepositoryError>> + Send;

    /// Change status and record why. Returns whether a row changed.
    fn set_status(
        &self,
        user_id: UserId,
        status: CredentialStatus,
        last_error: Option<&str>,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Record a transient failure without changing status.
    fn record_error(
        &self,
        user_id: UserId,
        error: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Record a successful `/users/me` validation.
    fn mark_validated(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Remove the user's connection. Returns whether one existed.
    fn delete(&self, user_id: UserId)
    -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Refreshable connections whose access token expires at or before
    /// `before`, soonest first.
    fn list_due_for_refresh(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<MlCredentials>, RepositoryError>> + Send;

    /// Move connections whose refresh token lapsed to
    /// `reauthorization_required`. Returns how many changed.
    fn expire_lapsed_refresh_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, RepositoryError>> + Send;
}

/// Message stored when a refresh token outlives its lifetime.
pub const REFRESH_TOKEN_LAPSED: &str = "refresh token expired";

const COLUMNS: &str = r"
    id, user_id, ml_user_id, nickname, site_id,
    access_token_encrypted, refresh_token_encrypted, scopes,
    access_token_expires_at, refresh_token_expires_at, status,
    last_refreshed_at, last_validated_at, last_error,
    created_at, updated_at
";

/// Internal row type for `PostgreSQL` queries.
#[derive(sqlx::FromRow)]
struct MlCredentialsRow {
    id: MlCredentialsId,
    user_id: UserId,
    ml_user_id: MlUserId,
    nickname: String,
    site_id: String,
    access_token_encrypted: String,
    refresh_token_encrypted: String,
    scopes: Vec<String>,
    access_token_expires_at: DateTime<Utc>,
    refresh_token_expires_at: DateTime<Utc>,
    status: CredentialStatus,
    last_refreshed_at: Option<DateTime<Utc>>,
    last_validated_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MlCredentialsRow> for MlCredentials {
    type Error = RepositoryError;

    fn try_from(row: MlCredentialsRow) -> Result<Self, Self::Error> {
        let site = row.site_id.parse::<MlSite>().map_err(|e| {
            RepositoryError::DataCorruption(format!("invalid site in ml_credentials: {e}"))
        })?;
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            ml_user_id: row.ml_user_id,
            nickname: row.nickname,
            site,
            access_token_encrypted: row.access_token_encrypted,
            refresh_token_encrypted: row.refresh_token_encrypted,
            scopes: row.scopes,
            access_token_expires_at: row.access_token_expires_at,
            refresh_token_expires_at: row.refresh_token_expires_at,
            status: row.status,
            last_refreshed_at: row.last_refreshed_at,
            last_validated_at: row.last_validated_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// `PostgreSQL` implementation of [`CredentialStore`].
///
/// Holds its own pool handle so it can live inside long-lived services.
#[derive(Debug, Clone)]
pub struct MlCredentialsRepository {
    pool: PgPool,
}

impl MlCredentialsRepository {
    /// Create a new credentials repository.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CredentialStore for MlCredentialsRepository {
    async fn find_by_user(&self, user_id: UserId) -> Result<Option<MlCredentials>, RepositoryError> {
        let row = sqlx::query_as::<_, MlCredentialsRow>(&format!(
            "SELECT {COLUMNS} FROM ml_credentials WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MlCredentials::try_from).transpose()
    }

    async fn upsert(&self, new: &NewMlCredentials) -> Result<MlCredentials, RepositoryError> {
        let row = sqlx::query_as::<_, MlCredentialsRow>(&format!(
            r"
            INSERT INTO ml_credentials (
                user_id, ml_user_id, nickname, site_id,
                access_token_encrypted, refresh_token_encrypted, scopes,
                access_token_expires_at, refresh_token_expires_at,
                status, last_refreshed_at, last_validated_at, last_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'active', NULL, NOW(), NULL)
            ON CONFLICT (user_id) DO UPDATE SET
                ml_user_id = EXCLUDED.ml_user_id,
                nickname = EXCLUDED.nickname,
                site_id = EXCLUDED.site_id,
                access_token_encrypted = EXCLUDED.access_token_encrypted,
                refresh_token_encrypted = EXCLUDED.refresh_token_encrypted,
                scopes = EXCLUDED.scopes,
                access_token_expires_at = EXCLUDED.access_token_expires_at,
                refresh_token_expires_at = EXCLUDED.refresh_token_expires_at,
                status = 'active',
                last_refreshed_at = NULL,
                last_validated_at = NOW(),
                last_error = NULL,
                updated_at = NOW()
            RETURNING {COLUMNS}
            "
        ))
        .bind(new.user_id)
        .bind(new.ml_user_id)
        .bind(&new.nickname)
        .bind(new.site)
        .bind(&new.access_token_encrypted)
        .bind(&new.refresh_token_encrypted)
        .bind(&new.scopes)
        .bind(new.access_token_expires_at)
        .bind(new.refresh_token_expires_at)
        .fetch_one(&self.pool)
        .await?;

        MlCredentials::try_from(row)
    }

    async fn update_tokens(
        &self,
        user_id: UserId,
        tokens: &RotatedTokens,
    ) -> Result<MlCredentials, RepositoryError> {
        let row = sqlx::query_as::<_, MlCredentialsRow>(&format!(
            r"
            UPDATE ml_credentials
            SET access_token_encrypted = $2,
                refresh_token_encrypted = $3,
                scopes = $4,
                access_token_expires_at = $5,
                refresh_token_expires_at = $6,
                last_refreshed_at = $7,
                status = 'active',
                last_error = NULL,
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING {COLUMNS}
            "
        ))
        .bind(user_id)
        .bind(&tokens.access_token_encrypted)
        .bind(&tokens.refresh_token_encrypted)
        .bind(&tokens.scopes)
        .bind(tokens.access_token_expires_at)
        .bind(tokens.refresh_token_expires_at)
        .bind(tokens.refreshed_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepositoryError::NotFound)?;

        MlCredentials::try_from(row)
    }

    async fn set_status(
        &self,
        user_id: UserId,
        status: CredentialStatus,
        last_error: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE ml_credentials
            SET status = $2, last_error = $3, updated_at = NOW()
            WHERE user_id = $1
            ",
        )
        .bind(user_id)
        .bind(status)
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_error(&self, user_id: UserId, error: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE ml_credentials
            SET last_error = $2, updated_at = NOW()
            WHERE user_id = $1
            ",
        )
        .bind(user_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_validated(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE ml_credentials
            SET last_validated_at = $2, updated_at = NOW()
            WHERE user_id = $1
            ",
        )
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, user_id: UserId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM ml_credentials WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_due_for_refresh(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MlCredentials>, RepositoryError> {
        let rows = sqlx::query_as::<_, MlCredentialsRow>(&format!(
            r"
            SELECT {COLUMNS}
            FROM ml_credentials
            WHERE status <> 'reauthorization_required'
              AND access_token_expires_at <= $1
            ORDER BY access_token_expires_at ASC
            LIMIT $2
            "
        ))
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MlCredentials::try_from).collect()
    }

    async fn expire_lapsed_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE ml_credentials
            SET status = 'reauthorization_required', last_error = $2, updated_at = NOW()
            WHERE status <> 'reauthorization_required'
              AND refresh_token_expires_at <= $1
            ",
        )
        .bind(now)
        .bind(REFRESH_TOKEN_LAPSED)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
