//! Retry policy for outgoing MercadoLibre requests.
//!
//! Exponential backoff with jitter. `429` honours `Retry-After`. Gateway
//! errors (`500`, `502`, `503`, `504`) and connection failures retry only
//! when the request is safe to repeat.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

/// Longest `Retry-After` we are willing to sleep inside a request.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Fraction of the backoff added or removed at random.
const JITTER_RATIO: f64 = 0.2;

/// Backoff schedule and attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per request, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Backoff before attempt `attempt + 1`, without jitter.
    ///
    /// `attempt` counts from 1: the delay after the first failure is
    /// `base_delay`, then it doubles up to `max_delay`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }

    /// [`RetryPolicy::backoff`] with +/- 20% jitter.
    #[must_use]
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let factor = rand::rng().random_range((1.0 - JITTER_RATIO)..=(1.0 + JITTER_RATIO));
        base.mul_f64(factor)
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    #[must_use]
    pub const fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retrying a response with `status`, or `None` if the
    /// response should be returned to the caller as is.
    #[must_use]
    pub fn delay_for_status(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        attempt: u32,
        idempotent: bool,
    ) -> Option<Duration> {
        if !self.can_retry(attempt) {
            return None;
        }
        match status {
            StatusCode::TOO_MANY_REQUESTS => Some(
                retry_after(headers)
                    .map_or_else(|| self.jittered_backoff(attempt), |d| d.min(MAX_RETRY_AFTER)),
            ),
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
                if idempotent =>
            {
                Some(self.jittered_backoff(attempt))
            }
            _ => None,
        }
    }

    /// Delay before retrying a transport failure, or `None` to give up.
    ///
    /// A connect failure means the request never reached the server, so it is
    /// retried even for non-idempotent calls. Timeouts are ambiguous and only
    /// retried when the request is safe to repeat.
    #[must_use]
    pub fn delay_for_error(
        &self,
        error: &reqwest::Error,
        attempt: u32,
        idempotent: bool,
    ) -> Option<Duration> {
        if !self.can_retry(attempt) {
            return None;
        }
        (error.is_connect() || (idempotent && error.is_timeout()))
            .then(|| self.jittered_backoff(attempt))
    }
}

/// Parse a `Retry-After` header given in seconds.
#[must_use]
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
        assert_eq!(policy.backoff(5), Duration::from_secs(8));
        assert_eq!(policy.backoff(40), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.jittered_backoff(2);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn test_429_honours_retry_after() {
        let policy = RetryPolicy::default();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));

        assert_eq!(
            policy.delay_for_status(StatusCode::TOO_MANY_REQUESTS, &headers, 1, false),
            Some(Duration::from_secs(3))
        );

        headers.insert(RETRY_AFTER, HeaderValue::from_static("3600"));
        assert_eq!(
            policy.delay_for_status(StatusCode::TOO_MANY_REQUESTS, &headers, 1, true),
            Some(MAX_RETRY_AFTER)
        );
    }

    #[test]
    fn test_server_errors_retry_only_when_idempotent() {
        let policy = RetryPolicy::default();
        let headers = HeaderMap::new();

        assert!(
            policy
                .delay_for_status(StatusCode::SERVICE_UNAVAILABLE, &headers, 1, true)
                .is_some()
        );
        assert!(
            policy
                .delay_for_status(StatusCode::SERVICE_UNAVAILABLE, &headers, 1, false)
                .is_none()
        );
        assert!(
            policy
                .delay_for_status(StatusCode::BAD_REQUEST, &headers, 1, true)
                .is_none()
        );
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::with_max_attempts(2);
        let headers = HeaderMap::new();
        assert!(
            policy
                .delay_for_status(StatusCode::BAD_GATEWAY, &headers, 1, true)
                .is_some()
        );
        assert!(
            policy
                .delay_for_status(StatusCode::BAD_GATEWAY, &headers, 2, true)
                .is_none()
        );
        assert_eq!(RetryPolicy::with_max_attempts(0).max_attempts, 1);
    }
}
