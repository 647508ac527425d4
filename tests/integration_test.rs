// Integration tests for Signup Gateway
//
// These tests drive the token lifecycle against a mock authorization server
// and exercise the HTTP surface through the full router.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

use signup_gateway::{
    auth::{
        CredentialRecord, CredentialStore, MemoryCredentialStore, OAuthClient, OAuthStateStore,
        SqliteCredentialStore, System, TokenError, TokenManager,
    },
    routes::{self, AppState},
};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

const ADMIN_KEY: &str = "test-admin-key";

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn oauth_client(server_url: &str) -> OAuthClient {
    OAuthClient {
        client_id: "signup-client".to_string(),
        client_secret: "signup-secret".to_string(),
        token_url: format!("{}/oauth/v1/token", server_url),
        authorize_url: format!("{}/oauth/authorize", server_url),
        redirect_uri: Some("https://signup.example.com/oauth/crm/callback".to_string()),
        scopes: vec!["crm.objects.contacts.write".to_string(), "oauth".to_string()],
    }
}

fn crm_manager(store: Arc<dyn CredentialStore>, server_url: &str) -> Arc<TokenManager> {
    let mut clients = HashMap::new();
    clients.insert(System::Crm, oauth_client(server_url));
    Arc::new(TokenManager::new(store, clients, 60, 5).expect("token manager"))
}

fn record(access: &str, refresh: &str, expires_at: i64) -> CredentialRecord {
    CredentialRecord {
        access_token: access.to_string(),
        refresh_token: refresh.to_string(),
        expires_at,
        updated_at: now_ms() - 3_600_000,
    }
}

fn build_app(tokens: Arc<TokenManager>) -> (Router, OAuthStateStore) {
    let oauth_states = OAuthStateStore::new(600);
    let state = AppState {
        admin_api_key: ADMIN_KEY.to_string(),
        tokens,
        oauth_states: oauth_states.clone(),
    };
    (routes::build_router(state), oauth_states)
}

async fn parse_json_body(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn admin_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", ADMIN_KEY))
        .body(Body::empty())
        .unwrap()
}

// ==================================================================================================
// Token Lifecycle Scenarios
// ==================================================================================================

#[tokio::test]
async fn test_expired_token_refreshed_with_rotation() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/oauth/v1/token")
        .match_body(mockito::Matcher::AllOf(vec![
            mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            mockito::Matcher::UrlEncoded("client_id".into(), "signup-client".into()),
            mockito::Matcher::UrlEncoded("client_secret".into(), "signup-secret".into()),
            mockito::Matcher::UrlEncoded("refresh_token".into(), "R1".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"access_token":"A2","refresh_token":"R2","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(MemoryCredentialStore::with_record(
        System::Crm,
        record("A1", "R1", now_ms() - 1000),
    ));
    let tokens = crm_manager(store.clone(), &server.url());

    let before = now_ms();
    let token = tokens.get_valid_access_token(System::Crm).await.unwrap();
    let after = now_ms();

    assert_eq!(token, "A2");
    mock.assert_async().await;

    let stored = store.load(System::Crm).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "A2");
    assert_eq!(stored.refresh_token, "R2");
    assert!(stored.expires_at >= before + 3_600_000);
    assert!(stored.expires_at <= after + 3_600_000);
}

#[tokio::test]
async fn test_refresh_without_rotation_keeps_refresh_token() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/oauth/v1/token")
        .with_status(200)
        .with_body(r#"{"access_token":"A2","expires_in":3600}"#)
        .create_async()
        .await;

    let store = Arc::new(MemoryCredentialStore::with_record(
        System::Crm,
        record("A1", "R1", now_ms() - 1000),
    ));
    let tokens = crm_manager(store.clone(), &server.url());

    assert_eq!(
        tokens.get_valid_access_token(System::Crm).await.unwrap(),
        "A2"
    );
    let stored = store.load(System::Crm).await.unwrap().unwrap();
    assert_eq!(stored.refresh_token, "R1");
}

#[tokio::test]
async fn test_fresh_token_skips_refresh() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/oauth/v1/token")
        .expect(0)
        .create_async()
        .await;

    let store = Arc::new(MemoryCredentialStore::with_record(
        System::Crm,
        record("A1", "R1", now_ms() + 600_000),
    ));
    let tokens = crm_manager(store.clone(), &server.url());

    for _ in 0..3 {
        assert_eq!(
            tokens.get_valid_access_token(System::Crm).await.unwrap(),
            "A1"
        );
    }

    mock.assert_async().await;
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn test_rejected_refresh_leaves_store_unchanged() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/oauth/v1/token")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant","error_description":"refresh token revoked"}"#)
        .create_async()
        .await;

    let original = record("A1", "R1", now_ms() - 1000);
    let store = Arc::new(MemoryCredentialStore::with_record(
        System::Crm,
        original.clone(),
    ));
    let tokens = crm_manager(store.clone(), &server.url());

    let err = tokens.get_valid_access_token(System::Crm).await.unwrap_err();
    assert!(matches!(err, TokenError::RefreshFailed { .. }));
    assert_eq!(store.load(System::Crm).await.unwrap(), Some(original));
}

#[tokio::test]
async fn test_failed_refresh_can_be_retried_later() {
    let mut server = mockito::Server::new_async().await;
    let failing = server
        .mock("POST", "/oauth/v1/token")
        .with_status(503)
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(MemoryCredentialStore::with_record(
        System::Crm,
        record("A1", "R1", now_ms() - 1000),
    ));
    let tokens = crm_manager(store.clone(), &server.url());

    assert!(tokens.get_valid_access_token(System::Crm).await.is_err());
    failing.assert_async().await;
    failing.remove_async().await;

    server
        .mock("POST", "/oauth/v1/token")
        .with_status(200)
        .with_body(r#"{"access_token":"A2","expires_in":3600}"#)
        .create_async()
        .await;

    assert_eq!(
        tokens.get_valid_access_token(System::Crm).await.unwrap(),
        "A2"
    );
}

#[tokio::test]
async fn test_sqlite_store_refresh_round() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/oauth/v1/token")
        .with_status(200)
        .with_body(r#"{"access_token":"A2","refresh_token":"R2","expires_in":1800}"#)
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(SqliteCredentialStore::open_in_memory().unwrap());
    store
        .save(System::Crm, &record("A1", "R1", now_ms() - 1000))
        .await
        .unwrap();
    let tokens = crm_manager(store.clone(), &server.url());

    assert_eq!(
        tokens.get_valid_access_token(System::Crm).await.unwrap(),
        "A2"
    );
    // Second call is served from the store
    assert_eq!(
        tokens.get_valid_access_token(System::Crm).await.unwrap(),
        "A2"
    );

    let stored = store.load(System::Crm).await.unwrap().unwrap();
    assert_eq!(stored.refresh_token, "R2");
}

#[tokio::test]
async fn test_concurrent_requests_single_refresh() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/oauth/v1/token")
        .with_status(200)
        .with_body(r#"{"access_token":"A2","refresh_token":"R2","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(MemoryCredentialStore::with_record(
        System::Crm,
        record("A1", "R1", now_ms() - 1000),
    ));
    let tokens = crm_manager(store.clone(), &server.url());

    let calls = (0..16).map(|_| {
        let tokens = tokens.clone();
        async move { tokens.get_valid_access_token(System::Crm).await }
    });
    let results = futures::future::join_all(calls).await;

    for result in results {
        assert_eq!(result.unwrap(), "A2");
    }
    mock.assert_async().await;
    assert_eq!(store.save_count(), 1);
}

// ==================================================================================================
// HTTP Surface
// ==================================================================================================

#[tokio::test]
async fn test_health_endpoints() {
    let tokens = crm_manager(Arc::new(MemoryCredentialStore::new()), "http://127.0.0.1:9");
    let (app, _) = build_app(tokens);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_json_body(response.into_body()).await;
    assert_eq!(body["status"], "ok");

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_json_body(response.into_body()).await;
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_admin_routes_require_key() {
    let tokens = crm_manager(Arc::new(MemoryCredentialStore::new()), "http://127.0.0.1:9");
    let (app, _) = build_app(tokens);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/integrations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_list_integrations_reports_status_without_tokens() {
    let store = Arc::new(MemoryCredentialStore::with_record(
        System::Crm,
        record("secret-access", "secret-refresh", now_ms() + 600_000),
    ));
    let tokens = crm_manager(store, "http://127.0.0.1:9");
    let (app, _) = build_app(tokens);

    let response = app
        .oneshot(admin_request("GET", "/admin/integrations"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = parse_json_body(response.into_body()).await;
    let raw = body.to_string();
    assert!(!raw.contains("secret-access"));
    assert!(!raw.contains("secret-refresh"));

    let integrations = body["integrations"].as_array().unwrap();
    let crm = integrations
        .iter()
        .find(|i| i["system"] == "crm")
        .unwrap();
    assert_eq!(crm["configured"], true);
    assert_eq!(crm["connected"], true);
    assert_eq!(crm["expired"], false);

    let calendar = integrations
        .iter()
        .find(|i| i["system"] == "calendar")
        .unwrap();
    assert_eq!(calendar["configured"], false);
    assert_eq!(calendar["connected"], false);
}

#[tokio::test]
async fn test_refresh_check_not_connected() {
    let tokens = crm_manager(Arc::new(MemoryCredentialStore::new()), "http://127.0.0.1:9");
    let (app, _) = build_app(tokens);

    let response = app
        .oneshot(admin_request(
            "POST",
            "/admin/integrations/crm/token/refresh-check",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = parse_json_body(response.into_body()).await;
    assert_eq!(body["error"]["type"], "integration_not_connected");
}

#[tokio::test]
async fn test_refresh_check_refresh_failure_is_bad_gateway() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/oauth/v1/token")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;

    let store = Arc::new(MemoryCredentialStore::with_record(
        System::Crm,
        record("A1", "R1", now_ms() - 1000),
    ));
    let tokens = crm_manager(store, &server.url());
    let (app, _) = build_app(tokens);

    let response = app
        .oneshot(admin_request(
            "POST",
            "/admin/integrations/crm/token/refresh-check",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let body = parse_json_body(response.into_body()).await;
    assert_eq!(body["error"]["type"], "integration_auth_failed");
}

#[tokio::test]
async fn test_refresh_check_valid_token() {
    let store = Arc::new(MemoryCredentialStore::with_record(
        System::Crm,
        record("A1", "R1", now_ms() + 600_000),
    ));
    let tokens = crm_manager(store, "http://127.0.0.1:9");
    let (app, _) = build_app(tokens);

    let response = app
        .oneshot(admin_request(
            "POST",
            "/admin/integrations/crm/token/refresh-check",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = parse_json_body(response.into_body()).await;
    assert_eq!(body["valid"], true);
    assert!(body["expires_at"].is_string());
    assert!(!body.to_string().contains("A1"));
}

#[tokio::test]
async fn test_unknown_integration_rejected() {
    let tokens = crm_manager(Arc::new(MemoryCredentialStore::new()), "http://127.0.0.1:9");
    let (app, _) = build_app(tokens);

    let response = app
        .oneshot(admin_request("GET", "/admin/integrations/billing/connect"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_connect_and_callback_flow() {
    let mut server = mockito::Server::new_async().await;
    let exchange = server
        .mock("POST", "/oauth/v1/token")
        .match_body(mockito::Matcher::AllOf(vec![
            mockito::Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            mockito::Matcher::UrlEncoded("code".into(), "code-123".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"access_token":"A1","refresh_token":"R1","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(MemoryCredentialStore::new());
    let tokens = crm_manager(store.clone(), &server.url());
    let (app, _) = build_app(tokens.clone());

    // Operator requests the authorization URL
    let response = app
        .clone()
        .oneshot(admin_request("GET", "/admin/integrations/crm/connect"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_json_body(response.into_body()).await;

    let authorize_url = reqwest::Url::parse(body["authorize_url"].as_str().unwrap()).unwrap();
    let params: HashMap<String, String> = authorize_url.query_pairs().into_owned().collect();
    assert_eq!(params["response_type"], "code");
    assert_eq!(params["client_id"], "signup-client");
    assert_eq!(
        params["redirect_uri"],
        "https://signup.example.com/oauth/crm/callback"
    );
    assert_eq!(params["scope"], "crm.objects.contacts.write oauth");
    let state = params["state"].clone();

    // Provider redirects back
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/oauth/crm/callback?code=code-123&state={}", state))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_json_body(response.into_body()).await;
    assert_eq!(body["connected"], true);

    exchange.assert_async().await;
    assert_eq!(
        tokens.get_valid_access_token(System::Crm).await.unwrap(),
        "A1"
    );

    // State tokens are single-use
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/oauth/crm/callback?code=code-123&state={}", state))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(store.save_count(), 1);
}

#[tokio::test]
async fn test_callback_rejects_unknown_state() {
    let mut server = mockito::Server::new_async().await;
    let exchange = server
        .mock("POST", "/oauth/v1/token")
        .expect(0)
        .create_async()
        .await;

    let tokens = crm_manager(Arc::new(MemoryCredentialStore::new()), &server.url());
    let (app, _) = build_app(tokens);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/oauth/crm/callback?code=code-123&state=forged")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    exchange.assert_async().await;
}

#[tokio::test]
async fn test_callback_reports_provider_denial() {
    let tokens = crm_manager(Arc::new(MemoryCredentialStore::new()), "http://127.0.0.1:9");
    let (app, states) = build_app(tokens);
    let state = states.issue(System::Crm);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/oauth/crm/callback?error=access_denied&state={}",
                    state
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = parse_json_body(response.into_body()).await;
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("access_denied"));
}

#[tokio::test]
async fn test_connect_unconfigured_integration() {
    let tokens = crm_manager(Arc::new(MemoryCredentialStore::new()), "http://127.0.0.1:9");
    let (app, _) = build_app(tokens);

    let response = app
        .oneshot(admin_request("GET", "/admin/integrations/calendar/connect"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
