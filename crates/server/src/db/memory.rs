//! In-memory [`CredentialStore`].
//!
//! Same semantics as the `PostgreSQL` repository, kept in a map. Used by
//! tests and for running the OAuth service without a database.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use mercado_lister_core::{CredentialStatus, MlCredentialsId, UserId};

use super::RepositoryError;
use super::ml_credentials::{CredentialStore, REFRESH_TOKEN_LAPSED};
use crate::models::{MlCredentials, NewMlCredentials, RotatedTokens};

/// Map-backed credential store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentialStore {
    inner: Arc<RwLock<State>>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i32,
    rows: HashMap<UserId, MlCredentials>,
}

impl InMemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored row as is, for arranging test scenarios.
    pub async fn put(&self, credentials: MlCredentials) {
        self.inner
            .write()
            .await
            .rows
            .insert(credentials.user_id, credentials);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn update<F>(&self, user_id: UserId, apply: F) -> bool
    where
        F: FnOnce(&mut MlCredentials) + Send,
    {
        let mut state = self.inner.write().await;
        state.rows.get_mut(&user_id).is_some_and(|row| {
            apply(row);
            row.updated_at = Utc::now();
            true
        })
    }
}

impl CredentialStore for InMemoryCredentialStore {
    async fn find_by_user(&self, user_id: UserId) -> Result<Option<MlCredentials>, RepositoryError> {
        Ok(self.inner.read().await.rows.get(&user_id).cloned())
    }

    async fn upsert(&self, new: &NewMlCredentials) -> Result<MlCredentials, RepositoryError> {
        let now = Utc::now();
        let mut state = self.inner.write().await;

        let (id, created_at) = match state.rows.get(&new.user_id) {
            Some(existing) => (existing.id, existing.created_at),
            None => {
                state.next_id += 1;
                (MlCredentialsId::new(state.next_id), now)
            }
        };

        let row = MlCredentials {
            id,
            user_id: new.user_id,
            ml_user_id: new.ml_user_id,
            nickname: new.nickname.clone(),
            site: new.site,
            access_token_encrypted: new.access_token_encrypted.clone(),
            refresh_token_encrypted: new.refresh_token_encrypted.clone(),
            scopes: new.scopes.clone(),
            access_token_expires_at: new.access_token_expires_at,
            refresh_token_expires_at: new.refresh_token_expires_at,
            status: CredentialStatus::Active,
            last_refreshed_at: None,
            last_validated_at: Some(now),
            last_error: None,
            created_at,
            updated_at: now,
        };
        state.rows.insert(new.user_id, row.clone());
        Ok(row)
    }

    async fn update_tokens(
        &self,
        user_id: UserId,
        tokens: &RotatedTokens,
    ) -> Result<MlCredentials, RepositoryError> {
        let mut state = self.inner.write().await;
        let row = state
            .rows
            .get_mut(&user_id)
            .ok_or(RepositoryError::NotFound)?;

        row.access_token_encrypted.clone_from(&tokens.access_token_encrypted);
        row.refresh_token_encrypted.clone_from(&tokens.refresh_token_encrypted);
        row.scopes.clone_from(&tokens.scopes);
        row.access_token_expires_at = tokens.access_token_expires_at;
        row.refresh_token_expires_at = tokens.refresh_token_expires_at;
        row.last_refreshed_at = Some(tokens.refreshed_at);
        row.status = CredentialStatus::Active;
        row.last_error = None;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn set_status(
        &self,
        user_id: UserId,
        status: CredentialStatus,
        last_error: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let last_error = last_error.map(str::to_string);
        Ok(self
            .update(user_id, move |row| {
                row.status = status;
                row.last_error = last_error;
            })
            .await)
    }

    async fn record_error(&self, user_id: UserId, error: &str) -> Result<bool, RepositoryError> {
        let error = error.to_string();
        Ok(self
            .update(user_id, move |row| row.last_error = Some(error))
            .await)
    }

    async fn mark_validated(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .update(user_id, move |row| row.last_validated_at = Some(at))
            .await)
    }

    async fn delete(&self, user_id: UserId) -> Result<bool, RepositoryError> {
        Ok(self.inner.write().await.rows.remove(&user_id).is_some())
    }

    async fn list_due_for_refresh(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MlCredentials>, RepositoryError> {
        let state = self.inner.read().await;
        let mut due: Vec<MlCredentials> = state
            .rows
            .values()
            .filter(|row| row.status.is_refreshable() && row.access_token_expires_at <= before)
            .cloned()
            .collect();
        due.sort_by_key(|row| row.access_token_expires_at);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn expire_lapsed_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut state = self.inner.write().await;
        let mut changed = 0;
        for row in state.rows.values_mut() {
            if row.status.is_refreshable() && row.refresh_token_expires_at <= now {
                row.status = CredentialStatus::ReauthorizationRequired;
                row.last_error = Some(REFRESH_TOKEN_LAPSED.to_string());
                row.updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }
}
