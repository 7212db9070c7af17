//! Server configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `DATABASE_URL` - `PostgreSQL` connection string
//! - `BASE_URL` - Public URL of this API (used to derive the OAuth redirect URI)
//! - `SESSION_SECRET` - Session secret (min 32 chars, high entropy)
//! - `ML_CLIENT_ID` - MercadoLibre application id
//! - `ML_CLIENT_SECRET` - MercadoLibre application secret
//! - `TOKEN_ENCRYPTION_KEY` - base64 encoded 32 byte key for token encryption at rest
//!
//! ## Optional
//! - `HOST` - Bind address (default: 127.0.0.1)
//! - `PORT` - Listen port (default: 8000)
//! - `FRONTEND_URL` - Where OAuth callbacks land the browser (default: `BASE_URL`)
//! - `ML_SITE` - Marketplace site id (default: MLA)
//! - `ML_REDIRECT_URI` - Registered redirect URI (default: `{BASE_URL}/mercadolibre/callback`)
//! - `ML_API_BASE_URL` - API host (default: <https://api.mercadolibre.com>)
//! - `ML_AUTH_BASE_URL` - Consent page host (default: regional host of `ML_SITE`)
//! - `ML_RATE_LIMIT_PER_SECOND` - Outgoing request budget (default: 10)
//! - `ML_MAX_RETRIES` - Attempts per request including the first (default: 3)
//! - `ML_REQUEST_TIMEOUT_SECS` - Per request timeout (default: 30)
//! - `ML_OAUTH_STATE_TTL_SECS` - Lifetime of a pending authorization (default: 600)
//! - `ML_REFRESH_INTERVAL_SECS` - Background refresh sweep interval (default: 900)
//! - `ML_REFRESH_WINDOW_SECS` - Refresh tokens expiring within this window (default: 3600)
//! - `SENTRY_DSN`, `SENTRY_ENVIRONMENT`, `SENTRY_SAMPLE_RATE`, `SENTRY_TRACES_SAMPLE_RATE`
//! - `LOG_FORMAT` - `json` for structured logs, anything else for text

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mercado_lister_core::MlSite;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

const MIN_SESSION_SECRET_LENGTH: usize = 32;
const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.3;
const TOKEN_ENCRYPTION_KEY_LEN: usize = 32;

pub const DEFAULT_ML_API_BASE_URL: &str = "https://api.mercadolibre.com";

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "secret",
    "password",
    "xxx",
    "todo",
    "fixme",
    "insert",
    "enter-",
    "put-your",
    "add-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `PostgreSQL` database connection URL (contains password)
    pub database_url: SecretString,
    /// IP address to bind the server to
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Public base URL of the API
    pub base_url: String,
    /// Frontend origin that OAuth results are redirected to
    pub frontend_url: String,
    /// Session secret
    pub session_secret: SecretString,
    /// base64 key used to encrypt stored OAuth tokens
    pub token_encryption_key: SecretString,
    /// MercadoLibre application configuration
    pub mercadolibre: MercadoLibreConfig,
    /// Background refresh configuration
    pub refresh: RefreshConfig,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment (e.g., "development", "staging", "production")
    pub sentry_environment: Option<String>,
    /// Sentry error sample rate (0.0 to 1.0)
    pub sentry_sample_rate: f32,
    /// Sentry traces sample rate for performance monitoring (0.0 to 1.0)
    pub sentry_traces_sample_rate: f32,
    pub log_format: LogFormat,
}

/// MercadoLibre application configuration.
///
/// Implements `Debug` manually to redact the client secret.
#[derive(Clone)]
pub struct MercadoLibreConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub site: MlSite,
    pub redirect_uri: String,
    pub api_base_url: String,
    pub auth_base_url: String,
    /// Outgoing requests allowed per second, shared by every tenant.
    pub rate_limit_per_second: NonZeroU32,
    /// Attempts per request, including the first one.
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub oauth_state_ttl: Duration,
}

impl std::fmt::Debug for MercadoLibreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MercadoLibreConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("site", &self.site)
            .field("redirect_uri", &self.redirect_uri)
            .field("api_base_url", &self.api_base_url)
            .field("auth_base_url", &self.auth_base_url)
            .field("rate_limit_per_second", &self.rate_limit_per_second)
            .field("max_retries", &self.max_retries)
            .field("request_timeout", &self.request_timeout)
            .field("oauth_state_ttl", &self.oauth_state_ttl)
            .finish()
    }
}

impl MercadoLibreConfig {
    /// Configuration pointing at the production MercadoLibre hosts for `site`.
    ///
    /// Limits and timeouts take their defaults.
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        client_secret: SecretString,
        site: MlSite,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            site,
            redirect_uri: redirect_uri.into(),
            api_base_url: DEFAULT_ML_API_BASE_URL.to_string(),
            auth_base_url: site.auth_base_url().to_string(),
            rate_limit_per_second: NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN),
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
            oauth_state_ttl: Duration::from_secs(600),
        }
    }

    fn from_lookup<F>(env: &F, base_url: &str) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let site = get_env_or_default(env, "ML_SITE", "MLA")
            .parse::<MlSite>()
            .map_err(|e| ConfigError::InvalidEnvVar("ML_SITE".to_string(), e.to_string()))?;

        let redirect_uri = get_optional_env(env, "ML_REDIRECT_URI").unwrap_or_else(|| {
            format!("{}/mercadolibre/callback", base_url.trim_end_matches('/'))
        });
        validate_url(&redirect_uri, "ML_REDIRECT_URI")?;

        let api_base_url = get_env_or_default(env, "ML_API_BASE_URL", DEFAULT_ML_API_BASE_URL);
        validate_url(&api_base_url, "ML_API_BASE_URL")?;
        let auth_base_url = get_env_or_default(env, "ML_AUTH_BASE_URL", site.auth_base_url());
        validate_url(&auth_base_url, "ML_AUTH_BASE_URL")?;

        let rate_limit = parse_env::<u32, F>(env, "ML_RATE_LIMIT_PER_SECOND", 10)?;
        let rate_limit_per_second = NonZeroU32::new(rate_limit).ok_or_else(|| {
            ConfigError::InvalidEnvVar(
                "ML_RATE_LIMIT_PER_SECOND".to_string(),
                "must be greater than zero".to_string(),
            )
        })?;

        let max_retries = parse_env::<u32, F>(env, "ML_MAX_RETRIES", 3)?.max(1);

        Ok(Self {
            client_id: get_required_env(env, "ML_CLIENT_ID")?,
            client_secret: get_validated_secret(env, "ML_CLIENT_SECRET")?,
            site,
            redirect_uri,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            auth_base_url: auth_base_url.trim_end_matches('/').to_string(),
            rate_limit_per_second,
            max_retries,
            request_timeout: Duration::from_secs(parse_env(env, "ML_REQUEST_TIMEOUT_SECS", 30)?),
            oauth_state_ttl: Duration::from_secs(parse_env(env, "ML_OAUTH_STATE_TTL_SECS", 600)?),
        })
    }
}

/// Background token refresh configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Access tokens expiring within this window are refreshed.
    pub window: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(900),
            window: Duration::from_secs(3600),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing, invalid, or
    /// if secrets fail validation (placeholder detection, entropy check).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`AppConfig::from_env`].
    pub fn from_lookup<F>(env: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = SecretString::from(get_required_env(env, "DATABASE_URL")?);
        let host = get_env_or_default(env, "HOST", "127.0.0.1")
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::InvalidEnvVar("HOST".to_string(), e.to_string()))?;
        let port = parse_env(env, "PORT", 8000_u16)?;

        let base_url = get_required_env(env, "BASE_URL")?
            .trim_end_matches('/')
            .to_string();
        validate_url(&base_url, "BASE_URL")?;
        let frontend_url = get_optional_env(env, "FRONTEND_URL")
            .map_or_else(|| base_url.clone(), |url| url.trim_end_matches('/').to_string());
        validate_url(&frontend_url, "FRONTEND_URL")?;

        let session_secret = get_validated_secret(env, "SESSION_SECRET")?;
        validate_session_secret(&session_secret, "SESSION_SECRET")?;

        let token_encryption_key = SecretString::from(get_required_env(env, "TOKEN_ENCRYPTION_KEY")?);
        validate_encryption_key(&token_encryption_key, "TOKEN_ENCRYPTION_KEY")?;

        let mercadolibre = MercadoLibreConfig::from_lookup(env, &base_url)?;
        let refresh = RefreshConfig {
            interval: Duration::from_secs(parse_env(env, "ML_REFRESH_INTERVAL_SECS", 900)?),
            window: Duration::from_secs(parse_env(env, "ML_REFRESH_WINDOW_SECS", 3600)?),
        };
        if refresh.interval.is_zero() {
            return Err(ConfigError::InvalidEnvVar(
                "ML_REFRESH_INTERVAL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let log_format = match get_optional_env(env, "LOG_FORMAT").as_deref() {
            Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            database_url,
            host,
            port,
            base_url,
            frontend_url,
            session_secret,
            token_encryption_key,
            mercadolibre,
            refresh,
            sentry_dsn: get_optional_env(env, "SENTRY_DSN"),
            sentry_environment: get_optional_env(env, "SENTRY_ENVIRONMENT"),
            sentry_sample_rate: get_optional_env(env, "SENTRY_SAMPLE_RATE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1.0),
            sentry_traces_sample_rate: get_optional_env(env, "SENTRY_TRACES_SAMPLE_RATE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.1),
            log_format,
        })
    }

    /// Returns the socket address for binding the server.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Frontend page that OAuth callback results are reported to.
    #[must_use]
    pub fn settings_url(&self) -> String {
        format!("{}/settings/mercadolibre", self.frontend_url)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn get_required_env<F>(env: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    get_optional_env(env, key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

/// Empty values count as unset.
fn get_optional_env<F>(env: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    env(key).filter(|v| !v.trim().is_empty())
}

fn get_env_or_default<F>(env: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    get_optional_env(env, key).unwrap_or_else(|| default.to_string())
}

fn parse_env<T, F>(env: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    get_optional_env(env, key).map_or(Ok(default), |raw| {
        raw.trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
    })
}

fn validate_url(value: &str, var_name: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(value)
        .map_err(|e| ConfigError::InvalidEnvVar(var_name.to_string(), e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidEnvVar(
            var_name.to_string(),
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }
    Ok(())
}

/// Validate that a session secret meets minimum length requirements.
fn validate_session_secret(secret: &SecretString, var_name: &str) -> Result<(), ConfigError> {
    let value = secret.expose_secret();
    if value.len() < MIN_SESSION_SECRET_LENGTH {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "must be at least {} characters (got {})",
                MIN_SESSION_SECRET_LENGTH,
                value.len()
            ),
        ));
    }
    Ok(())
}

/// The key must be standard base64 and decode to exactly 32 bytes.
fn validate_encryption_key(key: &SecretString, var_name: &str) -> Result<(), ConfigError> {
    let decoded = STANDARD
        .decode(key.expose_secret().trim())
        .map_err(|e| ConfigError::InvalidEnvVar(var_name.to_string(), e.to_string()))?;
    if decoded.len() != TOKEN_ENCRYPTION_KEY_LEN {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "must decode to {TOKEN_ENCRYPTION_KEY_LEN} bytes (got {})",
                decoded.len()
            ),
        ));
    }
    Ok(())
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)]
    let len = s.chars().count() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)]
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    for pattern in PLACEHOLDER_PATTERNS {
        if lower.contains(pattern) {
            return Err(ConfigError::InsecureSecret(
                var_name.to_string(),
                format!("appears to be a placeholder (contains '{pattern}')"),
            ));
        }
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1}). Use a randomly generated secret."
            ),
        ));
    }

    Ok(())
}

/// Load and validate a secret from environment.
fn get_validated_secret<F>(env: &F, key: &str) -> Result<SecretString, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = get_required_env(env, key)?;
    validate_secret_strength(&value, key)?;
    Ok(SecretString::from(value))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const KEY_B64: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DATABASE_URL", "postgres://localhost/mercado_lister"),
            ("BASE_URL", "https://api.lister.test/"),
            ("SESSION_SECRET", "k8Jq2vN5xR7tW1yZ4bC6dF9gH3mP0sLa"),
            ("ML_CLIENT_ID", "1234567890123456"),
            ("ML_CLIENT_SECRET", "Zq8Xw2Lm4Np6Rs1Tv3Yb5Hd7Jf9Kg0Qa"),
            ("TOKEN_ENCRYPTION_KEY", KEY_B64),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(&|key: &str| env.get(key).map(|v| (*v).to_string()))
    }

    #[test]
    fn test_defaults() {
        let config = load(&base_env()).unwrap();

        assert_eq!(config.port, 8000);
        assert_eq!(config.base_url, "https://api.lister.test");
        assert_eq!(config.frontend_url, "https://api.lister.test");
        assert_eq!(config.mercadolibre.site, MlSite::Mla);
        assert_eq!(
            config.mercadolibre.redirect_uri,
            "https://api.lister.test/mercadolibre/callback"
        );
        assert_eq!(config.mercadolibre.api_base_url, DEFAULT_ML_API_BASE_URL);
        assert_eq!(
            config.mercadolibre.auth_base_url,
            "https://auth.mercadolibre.com.ar"
        );
        assert_eq!(config.mercadolibre.rate_limit_per_second.get(), 10);
        assert_eq!(config.mercadolibre.max_retries, 3);
        assert_eq!(config.refresh, RefreshConfig::default());
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_site_selects_auth_host() {
        let mut env = base_env();
        env.insert("ML_SITE", "mlb");
        env.insert("FRONTEND_URL", "https://app.lister.test");
        env.insert("LOG_FORMAT", "JSON");

        let config = load(&env).unwrap();
        assert_eq!(config.mercadolibre.site, MlSite::Mlb);
        assert_eq!(
            config.mercadolibre.auth_base_url,
            "https://auth.mercadolivre.com.br"
        );
        assert_eq!(
            config.settings_url(),
            "https://app.lister.test/settings/mercadolibre"
        );
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_missing_client_id() {
        let mut env = base_env();
        env.remove("ML_CLIENT_ID");
        assert!(matches!(
            load(&env),
            Err(ConfigError::MissingEnvVar(key)) if key == "ML_CLIENT_ID"
        ));
    }

    #[test]
    fn test_encryption_key_must_be_32_bytes() {
        let mut env = base_env();
        env.insert("TOKEN_ENCRYPTION_KEY", "c2hvcnQ=");
        assert!(matches!(
            load(&env),
            Err(ConfigError::InsecureSecret(key, _)) if key == "TOKEN_ENCRYPTION_KEY"
        ));

        env.insert("TOKEN_ENCRYPTION_KEY", "not base64!");
        assert!(matches!(
            load(&env),
            Err(ConfigError::InvalidEnvVar(key, _)) if key == "TOKEN_ENCRYPTION_KEY"
        ));
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let mut env = base_env();
        env.insert("ML_RATE_LIMIT_PER_SECOND", "0");
        assert!(matches!(
            load(&env),
            Err(ConfigError::InvalidEnvVar(key, _)) if key == "ML_RATE_LIMIT_PER_SECOND"
        ));
    }

    #[test]
    fn test_unknown_site_rejected() {
        let mut env = base_env();
        env.insert("ML_SITE", "XYZ");
        assert!(matches!(load(&env), Err(ConfigError::InvalidEnvVar(_, _))));
    }

    #[test]
    fn test_placeholder_client_secret_rejected() {
        let mut env = base_env();
        env.insert("ML_CLIENT_SECRET", "your-client-secret-goes-here");
        assert!(matches!(
            load(&env),
            Err(ConfigError::InsecureSecret(key, _)) if key == "ML_CLIENT_SECRET"
        ));
    }

    #[test]
    fn test_shannon_entropy() {
        assert!((shannon_entropy("") - 0.0).abs() < f64::EPSILON);
        assert!((shannon_entropy("aaaaaaa") - 0.0).abs() < f64::EPSILON);
        assert!((shannon_entropy("ab") - 1.0).abs() < 0.01);
        assert!(shannon_entropy("aB3$xY9!mK2@nL5#") > 3.3);
    }

    #[test]
    fn test_validate_session_secret_too_short() {
        let secret = SecretString::from("short");
        assert!(validate_session_secret(&secret, "TEST_SESSION").is_err());
    }

    #[test]
    fn test_debug_redacts_client_secret() {
        let config = MercadoLibreConfig::new(
            "123",
            SecretString::from("super-sensitive-value"),
            MlSite::Mla,
            "https://api.lister.test/mercadolibre/callback",
        );
        let debug = format!("{config:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("super-sensitive-value"));
    }
}
