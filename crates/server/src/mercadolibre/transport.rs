//! Shared HTTP transport for every MercadoLibre call.
//!
//! One instance per process. All tenants share the same rate limiter, so the
//! application as a whole stays inside the per-app request quota.

use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::MercadoLibreError;
use super::retry::{RetryPolicy, retry_after};
use crate::config::MercadoLibreConfig;

const USER_AGENT: &str = concat!("mercado-lister/", env!("CARGO_PKG_VERSION"));

/// Rate limited, retrying HTTP transport.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    http: reqwest::Client,
    limiter: DefaultDirectRateLimiter,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("retry", &self.inner.retry)
            .finish_non_exhaustive()
    }
}

/// Error body returned by MercadoLibre on non-success responses.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl ApiErrorBody {
    pub(crate) fn code(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown_error")
    }

    pub(crate) fn text(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.error_description.clone())
            .unwrap_or_default()
    }
}

impl Transport {
    /// Build the transport from configuration.
    ///
    /// # Errors
    ///
    /// Returns `MercadoLibreError::Http` if the HTTP client cannot be built.
    pub fn new(config: &MercadoLibreConfig) -> Result<Self, MercadoLibreError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self::with_client(
            http,
            Quota::per_second(config.rate_limit_per_second),
            RetryPolicy::with_max_attempts(config.max_retries),
        ))
    }

    /// Build the transport around an existing client.
    #[must_use]
    pub fn with_client(http: reqwest::Client, quota: Quota, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                http,
                limiter: RateLimiter::direct(quota),
                retry,
            }),
        }
    }

    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry
    }

    /// Send a request, waiting for the rate limiter and retrying transient
    /// failures.
    ///
    /// `build` is called once per attempt. Set `idempotent` to `false` for
    /// requests that must not be repeated once the server may have seen them
    /// (token exchange and refresh).
    ///
    /// Non-success responses that are not retried are returned as `Ok`; use
    /// [`Transport::error_for_response`] to turn them into errors.
    ///
    /// # Errors
    ///
    /// Returns `MercadoLibreError::Http` if the last attempt failed to
    /// produce a response.
    pub async fn send<F>(
        &self,
        operation: &str,
        build: F,
        idempotent: bool,
    ) -> Result<Response, MercadoLibreError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let retry = self.inner.retry;
        let mut attempt = 1;

        loop {
            self.inner.limiter.until_ready().await;

            match build(&self.inner.http).send().await {
                Ok(response) => {
                    let status = response.status();
                    let Some(delay) =
                        retry.delay_for_status(status, response.headers(), attempt, idempotent)
                    else {
                        return Ok(response);
                    };
                    warn!(
                        operation,
                        attempt,
                        status = status.as_u16(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "MercadoLibre request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    let Some(delay) = retry.delay_for_error(&error, attempt, idempotent) else {
                        return Err(error.into());
                    };
                    warn!(
                        operation,
                        attempt,
                        error = %error,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "MercadoLibre request errored, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
            attempt += 1;
        }
    }

    /// Deserialize a successful response or convert a failed one.
    ///
    /// # Errors
    ///
    /// Returns the mapped API error, or `MercadoLibreError::Parse` if a
    /// success body does not match `T`.
    pub async fn read_json<T: DeserializeOwned>(
        response: Response,
    ) -> Result<T, MercadoLibreError> {
        if !response.status().is_success() {
            return Err(Self::error_for_response(response).await);
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| MercadoLibreError::Parse(e.to_string()))
    }

    /// Map a non-success API response to an error.
    pub async fn error_for_response(response: Response) -> MercadoLibreError {
        let status = response.status();
        let wait = retry_after(response.headers());
        let body = Self::error_body(response).await;
        debug!(status = status.as_u16(), error = body.code(), "MercadoLibre API error");

        match status {
            StatusCode::UNAUTHORIZED => MercadoLibreError::Unauthorized(body.text()),
            StatusCode::NOT_FOUND => MercadoLibreError::NotFound(body.text()),
            StatusCode::TOO_MANY_REQUESTS => {
                MercadoLibreError::RateLimited(wait.map_or(60, |d| d.as_secs()))
            }
            _ => MercadoLibreError::Api {
                status: status.as_u16(),
                error: body.code().to_string(),
                message: body.text(),
            },
        }
    }

    pub(crate) async fn error_body(response: Response) -> ApiErrorBody {
        response
            .bytes()
            .await
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_fallbacks() {
        let body: ApiErrorBody =
            serde_json::from_str(r#"{"error":"invalid_grant","error_description":"expired"}"#)
                .unwrap_or_default();
        assert_eq!(body.code(), "invalid_grant");
        assert_eq!(body.text(), "expired");

        let empty = ApiErrorBody::default();
        assert_eq!(empty.code(), "unknown_error");
        assert_eq!(empty.text(), "");
    }

    #[test]
    fn test_user_agent_carries_version() {
        assert!(USER_AGENT.starts_with("mercado-lister/"));
    }
}
