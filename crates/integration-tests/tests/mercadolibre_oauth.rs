//! MercadoLibre connection lifecycle against the mock API.
//!
//! Everything runs on the in-memory credential store, so no database is
//! needed.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use mercado_lister_core::{CredentialStatus, MlSite, UserId};
use mercado_lister_integration_tests::MockMercadoLibre;
use mercado_lister_server::config::RefreshConfig;
use mercado_lister_server::crypto::TokenCipher;
use mercado_lister_server::db::{CredentialStore, InMemoryCredentialStore};
use mercado_lister_server::mercadolibre::MercadoLibreError;
use mercado_lister_server::models::MlCredentials;
use mercado_lister_server::services::{
    ConnectionStatus, MlOAuthError, MlOAuthService, RefreshScheduler,
};
use secrecy::ExposeSecret;

type Service = MlOAuthService<InMemoryCredentialStore>;

const SELLER: i64 = 202_593_498;

fn cipher() -> TokenCipher {
    TokenCipher::new(&[7u8; 32]).unwrap()
}

fn service(mock: &MockMercadoLibre, store: &InMemoryCredentialStore) -> Service {
    MlOAuthService::new(store.clone(), &mock.config(), cipher()).unwrap()
}

async fn connect(mock: &MockMercadoLibre, service: &Service, user: UserId, seller: i64) -> MlCredentials {
    let request = service.start_authorization(user).await.unwrap();
    let code = mock.authorize(&request.authorization_url, seller);
    service
        .complete_authorization(user, &request.state, &code)
        .await
        .unwrap()
}

// =============================================================================
// Authorization
// =============================================================================

#[tokio::test]
async fn test_connect_stores_encrypted_tokens() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDAOFICIAL");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);

    let creds = connect(&mock, &service, user, SELLER).await;
    assert_eq!(creds.ml_user_id.get(), SELLER);
    assert_eq!(creds.nickname, "TIENDAOFICIAL");
    assert_eq!(creds.site, MlSite::Mla);
    assert_eq!(creds.status, CredentialStatus::Active);
    assert!(creds.scopes.iter().any(|s| s == "offline_access"));

    // Ciphertext only at rest.
    let row = store.find_by_user(user).await.unwrap().unwrap();
    assert!(!row.access_token_encrypted.contains("APP_USR"));
    assert!(!row.refresh_token_encrypted.contains("TG-refresh"));
    let refresh = cipher().decrypt(&row.refresh_token_encrypted).unwrap();
    assert!(mock.refresh_token_is_live(refresh.expose_secret()));

    let token = service.valid_access_token(user).await.unwrap();
    assert!(token.expose_secret().starts_with(&format!("APP_USR-{SELLER}-")));
}

#[tokio::test]
async fn test_state_is_single_use() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);

    let request = service.start_authorization(user).await.unwrap();
    let code = mock.authorize(&request.authorization_url, SELLER);
    service
        .complete_authorization(user, &request.state, &code)
        .await
        .unwrap();

    let replay = service
        .complete_authorization(user, &request.state, &code)
        .await;
    assert!(matches!(replay, Err(MlOAuthError::InvalidState)));
}

#[tokio::test]
async fn test_state_from_another_session_is_rejected() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);

    let request = service.start_authorization(UserId::new(1)).await.unwrap();
    let code = mock.authorize(&request.authorization_url, SELLER);

    let result = service
        .complete_authorization(UserId::new(2), &request.state, &code)
        .await;
    assert!(matches!(result, Err(MlOAuthError::StateUserMismatch)));
    assert!(store.is_empty().await);
    // The code was never spent.
    assert_eq!(mock.token_requests(), 0);
}

#[tokio::test]
async fn test_code_bound_to_other_challenge_fails_exchange() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);

    let request = service.start_authorization(user).await.unwrap();
    let code = mock.authorize_with_challenge("not-the-challenge-we-sent", SELLER);

    let result = service
        .complete_authorization(user, &request.state, &code)
        .await;
    assert!(matches!(
        result,
        Err(MlOAuthError::MercadoLibre(MercadoLibreError::InvalidGrant(_)))
    ));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_collaborator_profile_is_rejected() {
    let mock = MockMercadoLibre::start().await;
    mock.add_collaborator(SELLER, "OPERADOR");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);

    let request = service.start_authorization(user).await.unwrap();
    let code = mock.authorize(&request.authorization_url, SELLER);
    let result = service
        .complete_authorization(user, &request.state, &code)
        .await;

    assert!(matches!(
        result,
        Err(MlOAuthError::MercadoLibre(MercadoLibreError::CollaboratorAccount))
    ));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_collaborator_rejected_at_exchange() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "OPERADOR");
    mock.reject_operator_at_exchange(SELLER);
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);

    let request = service.start_authorization(user).await.unwrap();
    let code = mock.authorize(&request.authorization_url, SELLER);
    let result = service
        .complete_authorization(user, &request.state, &code)
        .await;

    assert!(matches!(
        result,
        Err(MlOAuthError::MercadoLibre(MercadoLibreError::CollaboratorAccount))
    ));
    assert!(store.is_empty().await);
}

// =============================================================================
// Refresh
// =============================================================================

#[tokio::test]
async fn test_refresh_rotates_the_pair() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);

    let before = connect(&mock, &service, user, SELLER).await;
    let old_refresh = cipher().decrypt(&before.refresh_token_encrypted).unwrap();

    let after = service.refresh(user).await.unwrap();
    assert_eq!(mock.refresh_requests(), 1);
    assert!(after.last_refreshed_at.is_some());
    assert_ne!(after.access_token_encrypted, before.access_token_encrypted);

    let new_refresh = cipher().decrypt(&after.refresh_token_encrypted).unwrap();
    assert!(!mock.refresh_token_is_live(old_refresh.expose_secret()));
    assert!(mock.refresh_token_is_live(new_refresh.expose_secret()));
}

#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);

    // Connect with a token inside the refresh margin, then serve long-lived
    // ones so only the first refresh is needed.
    mock.set_access_expires_in(60);
    connect(&mock, &service, user, SELLER).await;
    mock.set_access_expires_in(21_600);
    mock.set_refresh_delay(Duration::from_millis(200));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.valid_access_token(user).await })
        })
        .collect();

    let mut tokens = Vec::new();
    for task in tasks {
        tokens.push(task.await.unwrap().unwrap().expose_secret().to_string());
    }

    assert_eq!(mock.refresh_requests(), 1);
    assert!(tokens.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn test_rejected_refresh_token_requires_reauthorization() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);

    connect(&mock, &service, user, SELLER).await;
    mock.revoke_refresh_tokens();

    assert!(matches!(
        service.refresh(user).await,
        Err(MlOAuthError::ReauthorizationRequired)
    ));
    let row = store.find_by_user(user).await.unwrap().unwrap();
    assert_eq!(row.status, CredentialStatus::ReauthorizationRequired);
    assert!(row.last_error.is_some());

    // No further calls are made with a dead grant.
    let refreshes = mock.refresh_requests();
    assert!(matches!(
        service.valid_access_token(user).await,
        Err(MlOAuthError::ReauthorizationRequired)
    ));
    assert_eq!(mock.refresh_requests(), refreshes);
    assert!(matches!(
        service.connection_status(user, true).await.unwrap(),
        ConnectionStatus::ReauthorizationRequired(_)
    ));

    // Reconnecting makes the connection usable again.
    let creds = connect(&mock, &service, user, SELLER).await;
    assert_eq!(creds.status, CredentialStatus::Active);
    assert!(creds.last_error.is_none());
}

#[tokio::test]
async fn test_transient_refresh_failure_keeps_status() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);

    connect(&mock, &service, user, SELLER).await;
    // MercadoLibre unreachable.
    drop(mock);

    let result = service.refresh(user).await;
    assert!(matches!(result, Err(MlOAuthError::MercadoLibre(_))));
    let row = store.find_by_user(user).await.unwrap().unwrap();
    assert_eq!(row.status, CredentialStatus::Active);
    assert!(row.last_error.is_some());
}

#[tokio::test]
async fn test_failed_refresh_after_lapse_marks_expired() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);

    mock.set_access_expires_in(1);
    connect(&mock, &service, user, SELLER).await;
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    mock.fail_next_token_request(503);
    let result = service.refresh(user).await;
    assert!(matches!(result, Err(MlOAuthError::MercadoLibre(_))));
    let row = store.find_by_user(user).await.unwrap().unwrap();
    assert_eq!(row.status, CredentialStatus::Expired);
    assert!(row.last_error.is_some());
    // Still connected: the grant itself is fine.
    assert!(matches!(
        service.connection_status(user, false).await.unwrap(),
        ConnectionStatus::Connected(_)
    ));

    // The next use refreshes and restores the connection.
    mock.set_access_expires_in(21_600);
    let token = service.valid_access_token(user).await.unwrap();
    assert!(token.expose_secret().starts_with("APP_USR-"));
    let row = store.find_by_user(user).await.unwrap().unwrap();
    assert_eq!(row.status, CredentialStatus::Active);
    assert!(row.last_error.is_none());
    assert_eq!(mock.refresh_requests(), 1);
}

#[tokio::test]
async fn test_refresh_for_another_account_needs_reauthorization() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);

    let before = connect(&mock, &service, user, SELLER).await;
    mock.refresh_into_account(SELLER + 7);

    let result = service.refresh(user).await;
    assert!(matches!(
        result,
        Err(MlOAuthError::MercadoLibre(MercadoLibreError::AccountMismatch { .. }))
    ));
    let row = store.find_by_user(user).await.unwrap().unwrap();
    assert_eq!(row.status, CredentialStatus::ReauthorizationRequired);
    // Tokens for the other account were never stored.
    assert_eq!(row.access_token_encrypted, before.access_token_encrypted);
    assert_eq!(row.ml_user_id.get(), SELLER);
}

// =============================================================================
// API calls
// =============================================================================

#[tokio::test]
async fn test_rejected_access_token_is_refreshed_once() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);

    connect(&mock, &service, user, SELLER).await;
    mock.revoke_access_tokens();

    let status = service.connection_status(user, true).await.unwrap();
    let ConnectionStatus::Connected(details) = status else {
        panic!("expected connected, got {status:?}");
    };
    assert!(details.last_validated_at.is_some());
    assert!(details.last_refreshed_at.is_some());
    assert_eq!(mock.refresh_requests(), 1);
}

#[tokio::test]
async fn test_category_calls() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);
    connect(&mock, &service, user, SELLER).await;
    let api = service.api();

    let predictions = service
        .with_access_token(user, |token| async move {
            api.predict_category(&token, MlSite::Mla, "iphone 13 128gb", 2).await
        })
        .await
        .unwrap();
    assert_eq!(predictions.len(), 2);
    assert_eq!(predictions[0].category_id, "MLA1055");

    let category = service
        .with_access_token(user, |token| async move { api.category(&token, "MLA1055").await })
        .await
        .unwrap();
    assert!(category.is_leaf());
    assert_eq!(
        category.breadcrumb(),
        "Celulares y Teléfonos > Celulares y Smartphones"
    );

    let attributes = service
        .with_access_token(user, |token| async move {
            api.category_attributes(&token, "MLA1055").await
        })
        .await
        .unwrap();
    let required: Vec<_> = attributes
        .iter()
        .filter(|a| a.is_required())
        .map(|a| a.id.as_str())
        .collect();
    assert_eq!(required, vec!["BRAND"]);

    let missing = service
        .with_access_token(user, |token| async move { api.category(&token, "MLA0").await })
        .await;
    assert!(matches!(
        missing,
        Err(MlOAuthError::MercadoLibre(MercadoLibreError::NotFound(_)))
    ));
}

#[tokio::test]
async fn test_prediction_uses_the_sellers_site() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller_on(MlSite::Mlb, SELLER, "LOJAOFICIAL");
    let store = InMemoryCredentialStore::new();
    // Configured for Argentina.
    let service = service(&mock, &store);
    let user = UserId::new(1);

    let creds = connect(&mock, &service, user, SELLER).await;
    assert_eq!(creds.site, MlSite::Mlb);

    let site = service.connected_site(user).await.unwrap();
    assert_eq!(site, MlSite::Mlb);
    let api = service.api();
    let predictions = service
        .with_access_token(user, |token| async move {
            api.predict_category(&token, site, "tenis corrida", 1).await
        })
        .await
        .unwrap();
    assert_eq!(predictions[0].domain_id, "MLB-CELLPHONES");

    assert!(matches!(
        service.connected_site(UserId::new(2)).await,
        Err(MlOAuthError::NotConnected)
    ));
}

#[tokio::test]
async fn test_gateway_errors_are_retried() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);
    connect(&mock, &service, user, SELLER).await;
    let api = service.api();

    let calls = mock.api_requests();
    mock.fail_next(503, None);
    let category = service
        .with_access_token(user, |token| async move { api.category(&token, "MLA1055").await })
        .await
        .unwrap();
    assert_eq!(category.id, "MLA1055");
    assert_eq!(mock.api_requests(), calls + 2);
}

#[tokio::test]
async fn test_rate_limit_honours_retry_after() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);
    connect(&mock, &service, user, SELLER).await;
    let api = service.api();

    mock.fail_next(429, Some(0));
    let predictions = service
        .with_access_token(user, |token| async move {
            api.predict_category(&token, MlSite::Mla, "zapatillas running", 1).await
        })
        .await
        .unwrap();
    assert_eq!(predictions.len(), 1);
}

#[tokio::test]
async fn test_rate_limit_surfaces_after_retries() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);
    connect(&mock, &service, user, SELLER).await;
    let api = service.api();

    for _ in 0..3 {
        mock.fail_next(429, Some(0));
    }
    let result = service
        .with_access_token(user, |token| async move { api.category(&token, "MLA1055").await })
        .await;
    assert!(matches!(
        result,
        Err(MlOAuthError::MercadoLibre(MercadoLibreError::RateLimited(_)))
    ));
}

// =============================================================================
// Status and scheduler
// =============================================================================

#[tokio::test]
async fn test_status_and_disconnect() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);
    let user = UserId::new(1);

    assert!(matches!(
        service.connection_status(user, false).await.unwrap(),
        ConnectionStatus::NotConnected
    ));

    connect(&mock, &service, user, SELLER).await;
    let ConnectionStatus::Connected(details) = service.connection_status(user, true).await.unwrap()
    else {
        panic!("expected connected");
    };
    assert_eq!(details.nickname, "TIENDA");
    assert!(details.last_validated_at.is_some());

    assert!(service.disconnect(user).await.unwrap());
    assert!(matches!(
        service.valid_access_token(user).await,
        Err(MlOAuthError::NotConnected)
    ));
}

#[tokio::test]
async fn test_scheduler_refreshes_expiring_connections() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    mock.add_seller(SELLER + 1, "OTRATIENDA");
    mock.add_seller(SELLER + 2, "TRANQUILA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);

    mock.set_access_expires_in(600);
    connect(&mock, &service, UserId::new(1), SELLER).await;
    connect(&mock, &service, UserId::new(2), SELLER + 1).await;
    mock.set_access_expires_in(21_600);
    connect(&mock, &service, UserId::new(3), SELLER + 2).await;

    let scheduler = RefreshScheduler::new(
        service.clone(),
        RefreshConfig {
            interval: Duration::from_secs(900),
            window: Duration::from_secs(3600),
        },
    );
    let report = scheduler.sweep().await.unwrap();
    assert_eq!(report.candidates, 2);
    assert_eq!(report.refreshed, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(mock.refresh_requests(), 2);

    // Nothing left to do.
    let again = scheduler.sweep().await.unwrap();
    assert_eq!(again.candidates, 0);
}

#[tokio::test]
async fn test_scheduler_counts_dead_grants() {
    let mock = MockMercadoLibre::start().await;
    mock.add_seller(SELLER, "TIENDA");
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);

    mock.set_access_expires_in(600);
    connect(&mock, &service, UserId::new(1), SELLER).await;
    mock.revoke_refresh_tokens();

    let report = RefreshScheduler::new(service, RefreshConfig::default())
        .sweep()
        .await
        .unwrap();
    assert_eq!(report.reauthorization_required, 1);
    assert_eq!(report.refreshed, 0);
}

#[tokio::test]
async fn test_scheduler_drains_backlog_in_batches() {
    let mock = MockMercadoLibre::start().await;
    let store = InMemoryCredentialStore::new();
    let service = service(&mock, &store);

    mock.set_access_expires_in(600);
    for n in 0..5 {
        mock.add_seller(SELLER + n, &format!("TIENDA{n}"));
        connect(&mock, &service, UserId::new(n as i32 + 1), SELLER + n).await;
    }

    // Refreshed tokens are still short-lived and stay due: each connection
    // is refreshed once per sweep all the same.
    let report = RefreshScheduler::new(service, RefreshConfig::default())
        .with_batch_size(2)
        .sweep()
        .await
        .unwrap();
    assert_eq!(report.candidates, 5);
    assert_eq!(report.refreshed, 5);
    assert!(report.batches >= 3);
    assert_eq!(mock.refresh_requests(), 5);
}
