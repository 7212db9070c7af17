//! Pending OAuth authorizations.
//!
//! Each `state` value maps to the user who started the flow and the PKCE
//! verifier for that attempt. Entries expire after a TTL and are removed on
//! first use, so a callback URL cannot be replayed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use rand::Rng;
use rand::distr::Alphanumeric;

use mercado_lister_core::UserId;

use crate::mercadolibre::PkceVerifier;

const STATE_LEN: usize = 32;
const MAX_PENDING: u64 = 10_000;

/// An authorization that was started and not yet completed.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub user_id: UserId,
    pub verifier: PkceVerifier,
    /// Callback URL sent to the consent page; the code exchange repeats it.
    pub redirect_uri: String,
    pub created_at: DateTime<Utc>,
}

/// TTL cache of pending authorizations, keyed by `state`.
#[derive(Clone)]
pub struct OAuthStateStore {
    cache: Cache<String, PendingAuthorization>,
    ttl: Duration,
}

impl std::fmt::Debug for OAuthStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthStateStore")
            .field("ttl", &self.ttl)
            .field("pending", &self.cache.entry_count())
            .finish()
    }
}

impl OAuthStateStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(MAX_PENDING)
                .time_to_live(ttl)
                .build(),
            ttl,
        }
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Start an authorization for `user_id` returning to `redirect_uri`.
    /// Returns the `state` value and the pending entry stored under it.
    pub async fn start(
        &self,
        user_id: UserId,
        redirect_uri: &str,
    ) -> (String, PendingAuthorization) {
        let state = generate_state();
        let pending = PendingAuthorization {
            user_id,
            verifier: PkceVerifier::generate(),
            redirect_uri: redirect_uri.to_string(),
            created_at: Utc::now(),
        };
        self.cache.insert(state.clone(), pending.clone()).await;
        (state, pending)
    }

    /// Consume a `state` value. Returns `None` if it was never issued,
    /// already used or expired.
    pub async fn take(&self, state: &str) -> Option<PendingAuthorization> {
        let pending = self.cache.remove(state).await?;
        let age = Utc::now().signed_duration_since(pending.created_at);
        (age.to_std().unwrap_or_default() < self.ttl).then_some(pending)
    }
}

fn generate_state() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(STATE_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const CALLBACK: &str = "https://api.lister.test/mercadolibre/callback";

    #[tokio::test]
    async fn test_state_is_single_use() {
        let store = OAuthStateStore::new(Duration::from_secs(600));
        let (state, started) = store.start(UserId::new(3), CALLBACK).await;
        assert_eq!(state.len(), 32);
        assert!(state.chars().all(|c| c.is_ascii_alphanumeric()));

        let pending = store.take(&state).await.unwrap();
        assert_eq!(pending.user_id, UserId::new(3));
        assert_eq!(pending.verifier, started.verifier);
        assert_eq!(pending.redirect_uri, CALLBACK);

        assert!(store.take(&state).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_state() {
        let store = OAuthStateStore::new(Duration::from_secs(600));
        assert!(store.take("never-issued").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_state_is_rejected() {
        let store = OAuthStateStore::new(Duration::from_millis(50));
        let (state, _) = store.start(UserId::new(1), CALLBACK).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.take(&state).await.is_none());
    }

    #[tokio::test]
    async fn test_states_are_unique_per_attempt() {
        let store = OAuthStateStore::new(Duration::from_secs(600));
        let (a, pa) = store.start(UserId::new(1), CALLBACK).await;
        let (b, pb) = store.start(UserId::new(1), CALLBACK).await;
        assert_ne!(a, b);
        assert_ne!(pa.verifier, pb.verifier);
    }
}
