//! Storing rotated tokens when the database hiccups.
//!
//! The old refresh token is spent as soon as MercadoLibre answers, so the
//! service retries the write before giving up.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use mercado_lister_core::{CredentialStatus, UserId};
use mercado_lister_integration_tests::MockMercadoLibre;
use mercado_lister_server::crypto::TokenCipher;
use mercado_lister_server::db::{CredentialStore, InMemoryCredentialStore, RepositoryError};
use mercado_lister_server::models::{MlCredentials, NewMlCredentials, RotatedTokens};
use mercado_lister_server::services::{MlOAuthError, MlOAuthService};
use secrecy::ExposeSecret;

const SELLER: i64 = 202_593_498;

/// In-memory store whose next `update_tokens` calls fail.
#[derive(Clone)]
struct FlakyStore {
    inner: InMemoryCredentialStore,
    failing_updates: Arc<AtomicU32>,
    update_calls: Arc<AtomicU32>,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryCredentialStore::new(),
            failing_updates: Arc::new(AtomicU32::new(0)),
            update_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    fn fail_next_updates(&self, n: u32) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    fn update_calls(&self) -> u32 {
        self.update_calls.load(Ordering::SeqCst)
    }
}

impl CredentialStore for FlakyStore {
    async fn find_by_user(&self, user_id: UserId) -> Result<Option<MlCredentials>, RepositoryError> {
        self.inner.find_by_user(user_id).await
    }

    async fn upsert(&self, new: &NewMlCredentials) -> Result<MlCredentials, RepositoryError> {
        self.inner.upsert(new).await
    }

    async fn update_tokens(
        &self,
        user_id: UserId,
        tokens: &RotatedTokens,
    ) -> Result<MlCredentials, RepositoryError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.update_tokens(user_id, tokens).await
    }

    async fn set_status(
        &self,
        user_id: UserId,
        status: CredentialStatus,
        last_error: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        self.inner.set_status(user_id, status, last_error).await
    }

    async fn record_error(&self, user_id: UserId, error: &str) -> Result<bool, RepositoryError> {
        self.inner.record_error(user_id, error).await
    }

    async fn mark_validated(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.inner.mark_validated(user_id, at).await
    }

    async fn delete(&self, user_id: UserId) -> Result<bool, RepositoryError> {
        self.inner.delete(user_id).await
    }

    async fn list_due_for_refresh(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MlCredentials>, RepositoryError> {
        self.inner.list_due_for_refresh(before, limit).await
    }

    async fn expire_lapsed_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        self.inner.expire_lapsed_refresh_tokens(now).await
    }
}

fn cipher() -> TokenCipher {
    TokenCipher::new(&[7u8; 32]).unwrap()
}

async fn connected(mock: &MockMercadoLibre, store: &FlakyStore) -> MlOAuthService<FlakyStore> {
    mock.add_seller(SELLER, "TIENDA");
    let service = MlOAuthService::new(store.clone(), &mock.config(), cipher()).unwrap();
    let request = service.start_authorization(UserId::new(1)).await.unwrap();
    let code = mock.authorize(&request.authorization_url, SELLER);
    service
        .complete_authorization(UserId::new(1), &request.state, &code)
        .await
        .unwrap();
    service
}

#[tokio::test]
async fn test_rotated_tokens_survive_transient_write_failures() {
    let mock = MockMercadoLibre::start().await;
    let store = FlakyStore::new();
    let service = connected(&mock, &store).await;

    store.fail_next_updates(2);
    let creds = service.refresh(UserId::new(1)).await.unwrap();

    assert_eq!(store.update_calls(), 3);
    assert_eq!(mock.refresh_requests(), 1);
    let refresh = cipher().decrypt(&creds.refresh_token_encrypted).unwrap();
    assert!(mock.refresh_token_is_live(refresh.expose_secret()));
}

#[tokio::test]
async fn test_rotated_tokens_lost_after_three_failed_writes() {
    let mock = MockMercadoLibre::start().await;
    let store = FlakyStore::new();
    let service = connected(&mock, &store).await;
    let before = store.find_by_user(UserId::new(1)).await.unwrap().unwrap();

    store.fail_next_updates(3);
    let result = service.refresh(UserId::new(1)).await;

    assert!(matches!(
        result,
        Err(MlOAuthError::Repository(RepositoryError::Database(_)))
    ));
    assert_eq!(store.update_calls(), 3);
    // The stored refresh token was spent upstream.
    let row = store.find_by_user(UserId::new(1)).await.unwrap().unwrap();
    assert_eq!(row.refresh_token_encrypted, before.refresh_token_encrypted);
    let stale = cipher().decrypt(&row.refresh_token_encrypted).unwrap();
    assert!(!mock.refresh_token_is_live(stale.expose_secret()));
}
