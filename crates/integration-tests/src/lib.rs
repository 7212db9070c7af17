//! Integration tests for Mercado Lister.
//!
//! # Running Tests
//!
//! ```bash
//! # Everything that runs without a database
//! cargo test -p mercado-lister-integration-tests
//!
//! # Including PostgreSQL-backed tests (needs DATABASE_URL, migrated)
//! cargo test -p mercado-lister-integration-tests -- --include-ignored
//! ```
//!
//! [`MockMercadoLibre`] is an in-process stand-in for the MercadoLibre API
//! on an ephemeral port. It validates PKCE at the token endpoint, rotates
//! refresh tokens on every use and rejects reused ones with `invalid_grant`,
//! like the real service.

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use mercado_lister_core::MlSite;
use mercado_lister_server::config::MercadoLibreConfig;
use secrecy::SecretString;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

/// Client id the mock accepts.
pub const CLIENT_ID: &str = "1234567890";

/// Callback URL in [`MockMercadoLibre::config`].
pub const REDIRECT_URI: &str = "http://127.0.0.1/mercadolibre/callback";

/// Access token lifetime issued unless changed.
pub const DEFAULT_EXPIRES_IN: i64 = 21_600;

/// A failure to answer the next API call with.
#[derive(Debug, Clone, Copy)]
pub struct InjectedFailure {
    pub status: u16,
    pub retry_after: Option<u64>,
}

struct PendingCode {
    challenge: String,
    redirect_uri: String,
    user_id: i64,
}

struct Inner {
    issued: u64,
    expires_in: i64,
    refresh_delay: Duration,
    codes: HashMap<String, PendingCode>,
    access_tokens: HashMap<String, i64>,
    refresh_tokens: HashMap<String, i64>,
    profiles: HashMap<i64, Value>,
    operators_at_exchange: HashSet<i64>,
    failures: VecDeque<InjectedFailure>,
    token_failures: VecDeque<u16>,
    refresh_account: Option<i64>,
}

/// Shared state of the mock server.
pub struct MockState {
    inner: Mutex<Inner>,
    token_requests: AtomicUsize,
    refresh_requests: AtomicUsize,
    api_requests: AtomicUsize,
}

impl MockState {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// In-process MercadoLibre API.
pub struct MockMercadoLibre {
    pub base_url: String,
    state: Arc<MockState>,
    server: JoinHandle<()>,
}

impl Drop for MockMercadoLibre {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl MockMercadoLibre {
    /// Start the mock on `127.0.0.1` with an ephemeral port.
    ///
    /// # Panics
    ///
    /// Panics if the port cannot be bound.
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            inner: Mutex::new(Inner {
                issued: 0,
                expires_in: DEFAULT_EXPIRES_IN,
                refresh_delay: Duration::ZERO,
                codes: HashMap::new(),
                access_tokens: HashMap::new(),
                refresh_tokens: HashMap::new(),
                profiles: HashMap::new(),
                operators_at_exchange: HashSet::new(),
                failures: VecDeque::new(),
                token_failures: VecDeque::new(),
                refresh_account: None,
            }),
            token_requests: AtomicUsize::new(0),
            refresh_requests: AtomicUsize::new(0),
            api_requests: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/oauth/token", post(token))
            .route("/users/me", get(users_me))
            .route("/sites/{site}/domain_discovery/search", get(predict))
            .route("/categories/{id}", get(category))
            .route("/categories/{id}/attributes", get(attributes))
            .with_state(Arc::clone(&state));

        #[allow(clippy::expect_used)]
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock MercadoLibre");
        #[allow(clippy::expect_used)]
        let addr = listener.local_addr().expect("mock address");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            server,
        }
    }

    /// Client configuration pointing both hosts at the mock.
    #[must_use]
    pub fn config(&self) -> MercadoLibreConfig {
        let mut config = MercadoLibreConfig::new(
            CLIENT_ID,
            SecretString::from("mock-client-secret"),
            MlSite::Mla,
            REDIRECT_URI,
        );
        config.api_base_url.clone_from(&self.base_url);
        config.auth_base_url.clone_from(&self.base_url);
        config.rate_limit_per_second = NonZeroU32::new(200).unwrap_or(NonZeroU32::MIN);
        config.request_timeout = Duration::from_secs(5);
        config
    }

    /// Register a manager account on MercadoLibre Argentina.
    pub fn add_seller(&self, id: i64, nickname: &str) {
        self.add_seller_on(MlSite::Mla, id, nickname);
    }

    /// Register a manager account on `site`.
    pub fn add_seller_on(&self, site: MlSite, id: i64, nickname: &str) {
        self.state.lock().profiles.insert(
            id,
            json!({
                "id": id,
                "nickname": nickname,
                "site_id": site.id(),
                "email": format!("{}@example.com", nickname.to_lowercase()),
                "user_type": "normal",
                "tags": ["normal", "credits_profile"],
                "permalink": format!("http://perfil.mercadolibre.com.ar/{nickname}"),
            }),
        );
    }

    /// Register a collaborator account, recognisable by its profile tags.
    pub fn add_collaborator(&self, id: i64, nickname: &str) {
        self.state.lock().profiles.insert(
            id,
            json!({
                "id": id,
                "nickname": nickname,
                "site_id": "MLA",
                "user_type": "normal",
                "tags": ["normal", "operator"],
            }),
        );
    }

    /// Make the token endpoint refuse codes for `id` as a collaborator.
    pub fn reject_operator_at_exchange(&self, id: i64) {
        self.state.lock().operators_at_exchange.insert(id);
    }

    /// Play the consent page: `id` approves the request in
    /// `authorization_url`. Returns the authorization code.
    ///
    /// # Panics
    ///
    /// Panics if the URL lacks PKCE parameters or a state.
    #[must_use]
    pub fn authorize(&self, authorization_url: &str, id: i64) -> String {
        #[allow(clippy::expect_used)]
        let url = url::Url::parse(authorization_url).expect("authorization url");
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(params.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(params.get("client_id").map(String::as_str), Some(CLIENT_ID));
        assert_eq!(
            params.get("code_challenge_method").map(String::as_str),
            Some("S256")
        );
        assert!(params.contains_key("state"), "authorization url has no state");
        #[allow(clippy::expect_used)]
        let challenge = params.get("code_challenge").expect("code_challenge");
        #[allow(clippy::expect_used)]
        let redirect_uri = params.get("redirect_uri").expect("redirect_uri");
        self.issue_code(challenge, redirect_uri, id)
    }

    /// Issue a code bound to an arbitrary challenge.
    #[must_use]
    pub fn authorize_with_challenge(&self, challenge: &str, id: i64) -> String {
        self.issue_code(challenge, REDIRECT_URI, id)
    }

    fn issue_code(&self, challenge: &str, redirect_uri: &str, id: i64) -> String {
        let mut inner = self.state.lock();
        inner.issued += 1;
        let code = format!("TG-code-{id}-{}", inner.issued);
        inner.codes.insert(
            code.clone(),
            PendingCode {
                challenge: challenge.to_string(),
                redirect_uri: redirect_uri.to_string(),
                user_id: id,
            },
        );
        code
    }

    /// Lifetime of access tokens issued from now on.
    pub fn set_access_expires_in(&self, secs: i64) {
        self.state.lock().expires_in = secs;
    }

    /// Delay refresh responses, widening race windows.
    pub fn set_refresh_delay(&self, delay: Duration) {
        self.state.lock().refresh_delay = delay;
    }

    /// Invalidate every issued access token.
    pub fn revoke_access_tokens(&self) {
        self.state.lock().access_tokens.clear();
    }

    /// Invalidate every issued refresh token.
    pub fn revoke_refresh_tokens(&self) {
        self.state.lock().refresh_tokens.clear();
    }

    /// Answer the next API call (not token calls) with a failure.
    pub fn fail_next(&self, status: u16, retry_after: Option<u64>) {
        self.state.lock().failures.push_back(InjectedFailure {
            status,
            retry_after,
        });
    }

    /// Answer the next token endpoint call with `status`.
    pub fn fail_next_token_request(&self, status: u16) {
        self.state.lock().token_failures.push_back(status);
    }

    /// Issue refreshed tokens for account `id`, whoever the refresh token
    /// belonged to.
    pub fn refresh_into_account(&self, id: i64) {
        self.state.lock().refresh_account = Some(id);
    }

    /// Whether `refresh_token` would still be accepted.
    #[must_use]
    pub fn refresh_token_is_live(&self, refresh_token: &str) -> bool {
        self.state.lock().refresh_tokens.contains_key(refresh_token)
    }

    #[must_use]
    pub fn token_requests(&self) -> usize {
        self.state.token_requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn refresh_requests(&self) -> usize {
        self.state.refresh_requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn api_requests(&self) -> usize {
        self.state.api_requests.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Handlers
// =============================================================================

fn error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message,
            "status": status.as_u16(),
            "cause": [],
        })),
    )
        .into_response()
}

fn s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn issue(inner: &mut Inner, user_id: i64) -> Response {
    inner.issued += 1;
    let access_token = format!("APP_USR-{user_id}-{}", inner.issued);
    let refresh_token = format!("TG-refresh-{user_id}-{}", inner.issued);
    inner.access_tokens.insert(access_token.clone(), user_id);
    inner.refresh_tokens.insert(refresh_token.clone(), user_id);

    Json(json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": inner.expires_in,
        "scope": "offline_access read write",
        "user_id": user_id,
        "refresh_token": refresh_token,
    }))
    .into_response()
}

async fn token(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.token_requests.fetch_add(1, Ordering::SeqCst);
    if let Some(status) = state.lock().token_failures.pop_front() {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return error(status, "injected", "injected failure");
    }
    let field = |name: &str| form.get(name).map(String::as_str).unwrap_or_default();

    if field("client_id") != CLIENT_ID || field("client_secret").is_empty() {
        return error(StatusCode::UNAUTHORIZED, "invalid_client", "invalid client_id");
    }

    match field("grant_type") {
        "authorization_code" => {
            let mut inner = state.lock();
            let Some(pending) = inner.codes.remove(field("code")) else {
                return error(StatusCode::BAD_REQUEST, "invalid_grant", "invalid code");
            };
            if field("redirect_uri") != pending.redirect_uri {
                return error(
                    StatusCode::BAD_REQUEST,
                    "invalid_grant",
                    "redirect_uri does not match the authorization request",
                );
            }
            if s256(field("code_verifier")) != pending.challenge {
                return error(
                    StatusCode::BAD_REQUEST,
                    "invalid_grant",
                    "code_verifier does not match code_challenge",
                );
            }
            if inner.operators_at_exchange.contains(&pending.user_id) {
                return error(
                    StatusCode::BAD_REQUEST,
                    "invalid_operator_user_id",
                    "operator users cannot authorize applications",
                );
            }
            issue(&mut inner, pending.user_id)
        }
        "refresh_token" => {
            state.refresh_requests.fetch_add(1, Ordering::SeqCst);
            let delay = state.lock().refresh_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut inner = state.lock();
            let Some(user_id) = inner.refresh_tokens.remove(field("refresh_token")) else {
                return error(StatusCode::BAD_REQUEST, "invalid_grant", "invalid refresh_token");
            };
            let user_id = inner.refresh_account.unwrap_or(user_id);
            issue(&mut inner, user_id)
        }
        other => error(
            StatusCode::BAD_REQUEST,
            "unsupported_grant_type",
            &format!("unsupported grant_type {other}"),
        ),
    }
}

/// Counts the call, then applies an injected failure or checks the bearer.
fn gate(state: &MockState, headers: &HeaderMap) -> Result<i64, Response> {
    state.api_requests.fetch_add(1, Ordering::SeqCst);
    let mut inner = state.lock();

    if let Some(failure) = inner.failures.pop_front() {
        let status =
            StatusCode::from_u16(failure.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = error(status, "injected", "injected failure");
        if let Some(secs) = failure.retry_after
            && let Ok(value) = secs.to_string().parse()
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return Err(response);
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .and_then(|token| inner.access_tokens.get(token).copied())
        .ok_or_else(|| error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid access token"))
}

async fn users_me(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    let user_id = match gate(&state, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.lock().profiles.get(&user_id) {
        Some(profile) => Json(profile.clone()).into_response(),
        None => error(StatusCode::NOT_FOUND, "not_found", "user not found"),
    }
}

async fn predict(
    State(state): State<Arc<MockState>>,
    Path(site): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = gate(&state, &headers) {
        return response;
    }
    let limit: usize = query
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(1);
    let title = query.get("q").cloned().unwrap_or_default();

    let predictions: Vec<Value> = [
        ("MLA1055", "Celulares y Smartphones", "CELLPHONES"),
        ("MLA3502", "Accesorios para Celulares", "CELLPHONE_ACCESSORIES"),
        ("MLA1051", "Celulares y Teléfonos", "PHONES"),
    ]
    .iter()
    .take(limit)
    .map(|(id, name, domain)| {
        json!({
            "domain_id": format!("{site}-{domain}"),
            "domain_name": name,
            "category_id": id,
            "category_name": name,
            "attributes": [{"id": "BRAND", "name": "Marca", "value_name": title}],
        })
    })
    .collect();
    Json(predictions).into_response()
}

async fn category(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = gate(&state, &headers) {
        return response;
    }
    if id != "MLA1055" {
        return error(StatusCode::NOT_FOUND, "not_found", "Category not found");
    }
    Json(json!({
        "id": "MLA1055",
        "name": "Celulares y Smartphones",
        "path_from_root": [
            {"id": "MLA1051", "name": "Celulares y Teléfonos"},
            {"id": "MLA1055", "name": "Celulares y Smartphones"},
        ],
        "children_categories": [],
        "total_items_in_this_category": 52_301,
        "settings": {"listing_allowed": true, "max_pictures_per_item": 12},
    }))
    .into_response()
}

async fn attributes(
    State(state): State<Arc<MockState>>,
    Path(_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = gate(&state, &headers) {
        return response;
    }
    Json(json!([
        {
            "id": "BRAND",
            "name": "Marca",
            "value_type": "string",
            "tags": {"required": true, "catalog_required": true},
            "values": [{"id": "9344", "name": "Apple"}],
        },
        {
            "id": "COLOR",
            "name": "Color",
            "value_type": "list",
            "tags": {},
            "values": [{"id": "52049", "name": "Negro"}],
        },
    ]))
    .into_response()
}
