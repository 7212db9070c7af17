//! Background token refresh.
//!
//! Periodically refreshes access tokens that are about to expire so user
//! requests rarely pay for a refresh, and flags connections whose refresh
//! token has lapsed.

use std::collections::HashSet;
use std::time::Duration;

use mercado_lister_core::UserId;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};

use crate::config::RefreshConfig;
use crate::db::CredentialStore;
use crate::services::ml_oauth::{MlOAuthError, MlOAuthService, RefreshOutcome};

const DEFAULT_BATCH_SIZE: i64 = 100;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Connections found expiring within the window.
    pub candidates: usize,
    /// Store queries it took to drain the backlog.
    pub batches: usize,
    pub refreshed: usize,
    /// Connections that now need the user to reconnect.
    pub reauthorization_required: usize,
    /// Transient failures, retried on the next sweep.
    pub failed: usize,
    /// Connections flagged because their refresh token lapsed.
    pub expired_refresh_tokens: u64,
}

/// Periodic refresher over every stored connection.
pub struct RefreshScheduler<S> {
    service: MlOAuthService<S>,
    interval: Duration,
    window: Duration,
    batch_size: i64,
}

impl<S: CredentialStore> RefreshScheduler<S> {
    #[must_use]
    pub const fn new(service: MlOAuthService<S>, config: RefreshConfig) -> Self {
        Self {
            service,
            interval: config.interval,
            window: config.window,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Number of connections loaded per store query.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run one pass: flag lapsed refresh tokens, then refresh every
    /// connection whose access token expires within the window, loading them
    /// in batches until none are left. Each connection is tried at most once
    /// per sweep.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store cannot be queried. Failures for
    /// individual connections are counted in the report.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, MlOAuthError> {
        let mut report = SweepReport {
            expired_refresh_tokens: self.service.expire_lapsed_refresh_tokens().await?,
            ..SweepReport::default()
        };
        if report.expired_refresh_tokens > 0 {
            warn!(
                count = report.expired_refresh_tokens,
                "Connections need reauthorization, refresh token lapsed"
            );
        }

        // Rows that failed, or came back with a short lifetime, stay due.
        // Widen each query past the ones already tried.
        let mut attempted: HashSet<UserId> = HashSet::new();
        loop {
            let limit = self
                .batch_size
                .max(1)
                .saturating_add(i64::try_from(attempted.len()).unwrap_or(i64::MAX));
            let due = self.service.due_for_refresh(self.window, limit).await?;
            report.batches += 1;
            let exhausted = i64::try_from(due.len()).unwrap_or(i64::MAX) < limit;

            let fresh: Vec<_> = due
                .into_iter()
                .filter(|creds| !attempted.contains(&creds.user_id))
                .collect();
            if fresh.is_empty() {
                break;
            }

            for creds in fresh {
                report.candidates += 1;
                attempted.insert(creds.user_id);
                match self.service.refresh_if_due(creds.user_id, self.window).await {
                    Ok(RefreshOutcome::Refreshed) => report.refreshed += 1,
                    Ok(RefreshOutcome::NotDue) => {
                        debug!(user_id = %creds.user_id, "Refreshed concurrently, skipping");
                    }
                    Err(MlOAuthError::ReauthorizationRequired) => {
                        report.reauthorization_required += 1;
                    }
                    // Disconnected while the sweep ran.
                    Err(MlOAuthError::NotConnected) => {}
                    Err(e) => {
                        warn!(user_id = %creds.user_id, error = %e, "Scheduled refresh failed");
                        report.failed += 1;
                    }
                }
            }

            if exhausted {
                break;
            }
        }

        if report.candidates > 0 {
            info!(
                candidates = report.candidates,
                refreshed = report.refreshed,
                reauthorization_required = report.reauthorization_required,
                failed = report.failed,
                batches = report.batches,
                "Token refresh sweep finished"
            );
        }
        Ok(report)
    }

    /// Run sweeps every interval until `shutdown` flips to `true`.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            window_secs = self.window.as_secs(),
            "Starting token refresh scheduler"
        );
        tokio::spawn(async move {
            let mut timer = interval(self.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!(error = %e, "Token refresh sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Token refresh scheduler stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
