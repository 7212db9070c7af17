//! MercadoLibre OAuth 2.0 client.
//!
//! The consent page lives on the regional auth host of the site; the token
//! endpoint is `POST {api}/oauth/token` with a form body.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mercado_lister_core::MlUserId;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::instrument;
use url::Url;

use super::pkce::{PkceChallenge, PkceVerifier};
use super::transport::Transport;
use super::MercadoLibreError;
use crate::config::MercadoLibreConfig;

/// Access token lifetime when the response omits `expires_in` (6 hours).
const DEFAULT_ACCESS_TOKEN_SECS: i64 = 21_600;

/// Refresh tokens are valid for 180 days from issue and every refresh
/// issues a new one.
pub const REFRESH_TOKEN_LIFETIME_DAYS: i64 = 180;

/// Error code MercadoLibre returns when a collaborator account authorizes.
const COLLABORATOR_ERROR: &str = "invalid_operator_user_id";

/// Tokens obtained from an exchange or refresh.
#[derive(Clone)]
pub struct MlToken {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub token_type: String,
    pub scopes: Vec<String>,
    /// Account the tokens act for.
    pub ml_user_id: MlUserId,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for MlToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlToken")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("scopes", &self.scopes)
            .field("ml_user_id", &self.ml_user_id)
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("refresh_token_expires_at", &self.refresh_token_expires_at)
            .finish()
    }
}

impl MlToken {
    /// Check if the access token has expired, with a 60 second buffer.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.access_token_expires_at - ChronoDuration::seconds(60)
    }

    /// Check if the access token will expire within the given number of seconds.
    #[must_use]
    pub fn expires_within_at(&self, seconds: i64, now: DateTime<Utc>) -> bool {
        now >= self.access_token_expires_at - ChronoDuration::seconds(seconds)
    }

    /// Check if the refresh token is still usable.
    #[must_use]
    pub fn can_refresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.refresh_token_expires_at - ChronoDuration::seconds(60)
    }
}

/// Response from `POST /oauth/token`.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    user_id: i64,
}

impl TokenResponse {
    fn into_token(self, now: DateTime<Utc>) -> Result<MlToken, MercadoLibreError> {
        // Without offline_access no refresh token is issued and the
        // connection would die in six hours.
        let refresh_token = self.refresh_token.filter(|t| !t.is_empty()).ok_or_else(|| {
            MercadoLibreError::OAuth {
                error: "missing_refresh_token".to_string(),
                message: "token response has no refresh_token, is offline_access enabled?"
                    .to_string(),
            }
        })?;

        let expires_in = self
            .expires_in
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_ACCESS_TOKEN_SECS);

        Ok(MlToken {
            access_token: SecretString::from(self.access_token),
            refresh_token: SecretString::from(refresh_token),
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scopes: self
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            ml_user_id: MlUserId::new(self.user_id),
            access_token_expires_at: now + ChronoDuration::seconds(expires_in),
            refresh_token_expires_at: now + ChronoDuration::days(REFRESH_TOKEN_LIFETIME_DAYS),
        })
    }
}

/// OAuth client for one MercadoLibre application.
#[derive(Clone)]
pub struct OAuthClient {
    transport: Transport,
    client_id: String,
    client_secret: SecretString,
    redirect_uri: String,
    auth_base_url: String,
    token_url: String,
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .field("auth_base_url", &self.auth_base_url)
            .field("token_url", &self.token_url)
            .finish()
    }
}

impl OAuthClient {
    #[must_use]
    pub fn new(config: &MercadoLibreConfig, transport: Transport) -> Self {
        Self {
            transport,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            auth_base_url: config.auth_base_url.trim_end_matches('/').to_string(),
            token_url: format!("{}/oauth/token", config.api_base_url.trim_end_matches('/')),
        }
    }

    /// Registered callback URL.
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Build the consent page URL the browser is sent to. The code exchange
    /// must present the same `redirect_uri`.
    ///
    /// # Errors
    ///
    /// Returns `MercadoLibreError::Url` if the configured auth host is not a URL.
    pub fn authorization_url(
        &self,
        state: &str,
        challenge: &PkceChallenge,
        redirect_uri: &str,
    ) -> Result<String, MercadoLibreError> {
        let mut url = Url::parse(&format!("{}/authorization", self.auth_base_url))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state)
            .append_pair("code_challenge", challenge.as_str())
            .append_pair("code_challenge_method", challenge.method());
        Ok(url.into())
    }

    /// Exchange an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// Returns `MercadoLibreError::InvalidGrant` if the code is invalid,
    /// expired, already used or does not match the verifier.
    /// Returns `MercadoLibreError::CollaboratorAccount` if a collaborator
    /// account authorized the application.
    #[instrument(skip(self, code, verifier))]
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: &PkceVerifier,
        redirect_uri: &str,
    ) -> Result<MlToken, MercadoLibreError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", verifier.as_str()),
        ];
        self.token_request("oauth.exchange_code", &form).await
    }

    /// Trade a refresh token for a new token pair.
    ///
    /// The old refresh token is spent even if the caller fails to store the
    /// new one.
    ///
    /// # Errors
    ///
    /// Returns `MercadoLibreError::InvalidGrant` if the refresh token was
    /// revoked, expired or already used.
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh(&self, refresh_token: &SecretString) -> Result<MlToken, MercadoLibreError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("refresh_token", refresh_token.expose_secret()),
        ];
        self.token_request("oauth.refresh", &form).await
    }

    async fn token_request(
        &self,
        operation: &str,
        form: &[(&str, &str)],
    ) -> Result<MlToken, MercadoLibreError> {
        let response = self
            .transport
            .send(
                operation,
                |http| {
                    http.post(&self.token_url)
                        .header(reqwest::header::ACCEPT, "application/json")
                        .form(form)
                },
                false,
            )
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: TokenResponse = Transport::read_json(response).await?;
            return body.into_token(Utc::now());
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Transport::error_for_response(response).await);
        }

        let body = Transport::error_body(response).await;
        Err(match body.code() {
            "invalid_grant" => MercadoLibreError::InvalidGrant(body.text()),
            COLLABORATOR_ERROR => MercadoLibreError::CollaboratorAccount,
            code => MercadoLibreError::OAuth {
                error: code.to_string(),
                message: body.text(),
            },
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use mercado_lister_core::MlSite;

    use super::*;

    fn client() -> OAuthClient {
        let config = MercadoLibreConfig::new(
            "4242",
            SecretString::from("s3cr3t"),
            MlSite::Mlm,
            "https://api.lister.test/mercadolibre/callback",
        );
        let transport = Transport::new(&config).unwrap();
        OAuthClient::new(&config, transport)
    }

    #[test]
    fn test_authorization_url() {
        let verifier = PkceVerifier::generate();
        let challenge = verifier.challenge();
        let client = client();
        let url = client
            .authorization_url("st4te", &challenge, client.redirect_uri())
            .unwrap();
        let url = Url::parse(&url).unwrap();

        assert_eq!(url.host_str(), Some("auth.mercadolibre.com.mx"));
        assert_eq!(url.path(), "/authorization");

        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "4242");
        assert_eq!(
            query["redirect_uri"],
            "https://api.lister.test/mercadolibre/callback"
        );
        assert_eq!(query["state"], "st4te");
        assert_eq!(query["code_challenge"], challenge.as_str());
        assert_eq!(query["code_challenge_method"], "S256");
        assert!(!url.as_str().contains(verifier.as_str()));
    }

    #[test]
    fn test_token_response_lifetimes() {
        let now = Utc::now();
        let body: TokenResponse = serde_json::from_str(
            r#"{
                "access_token": "APP_USR-1",
                "token_type": "Bearer",
                "expires_in": 21600,
                "scope": "offline_access read write",
                "user_id": 777,
                "refresh_token": "TG-1"
            }"#,
        )
        .unwrap();
        let token = body.into_token(now).unwrap();

        assert_eq!(token.ml_user_id, MlUserId::new(777));
        assert_eq!(token.scopes, vec!["offline_access", "read", "write"]);
        assert_eq!(
            token.access_token_expires_at,
            now + ChronoDuration::hours(6)
        );
        assert_eq!(
            token.refresh_token_expires_at,
            now + ChronoDuration::days(180)
        );
        assert!(!token.is_expired_at(now));
        assert!(token.expires_within_at(21_600, now));
        assert!(token.can_refresh_at(now));
    }

    #[test]
    fn test_token_response_without_refresh_token_is_rejected() {
        let body: TokenResponse =
            serde_json::from_str(r#"{"access_token": "APP_USR-1", "user_id": 1}"#).unwrap();
        assert!(matches!(
            body.into_token(Utc::now()),
            Err(MercadoLibreError::OAuth { error, .. }) if error == "missing_refresh_token"
        ));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let body: TokenResponse = serde_json::from_str(
            r#"{"access_token": "APP_USR-visible", "refresh_token": "TG-visible", "user_id": 1}"#,
        )
        .unwrap();
        let debug = format!("{:?}", body.into_token(Utc::now()).unwrap());
        assert!(!debug.contains("visible"));
    }
}
