//! Forward-auth surface tests driven through the router with `oneshot`

use auth_gateway::{
    AdmissionEngine, GatewayConfig, InMemoryWhitelistStore, JwtVerifier, RulesetSource,
    SyncOptions, WhitelistStore, WhitelistSynchronizer,
};
use axum::{
    body::Body,
    http::{header::LOCATION, Request, StatusCode},
    Router,
};
use gateway_server::{create_router, AppState};
use jsonwebtoken::{encode, EncodingKey, Header};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &str = "forward-auth-secret";

fn config(denial_mode: &str) -> GatewayConfig {
    serde_json::from_value(serde_json::json!({
        "token": { "secret": SECRET },
        "whitelist": { "static_urls": ["/health", "/assets/**"] },
        "admission": {
            "login_url": "https://login.example.com/",
            "default_home_url": "https://app.example.com/",
            "denial_mode": denial_mode
        }
    }))
    .unwrap()
}

async fn app_with(denial_mode: &str) -> (Router, Arc<InMemoryWhitelistStore>, Arc<WhitelistSynchronizer>) {
    let config = config(denial_mode);
    let store = Arc::new(InMemoryWhitelistStore::new());
    store.register_source("svc-a");
    store.add_specifications("svc-a", ["/api/a/public/**"]);

    let sync = Arc::new(WhitelistSynchronizer::new(
        Arc::clone(&store) as Arc<dyn WhitelistStore>,
        SyncOptions::from_config(&config),
    ));
    sync.refresh_all().await.unwrap();

    let verifier = Arc::new(JwtVerifier::new(&config.token).unwrap());
    let engine = Arc::new(
        AdmissionEngine::new(
            Arc::clone(&sync) as Arc<dyn RulesetSource>,
            verifier,
            &config.admission,
        )
        .unwrap(),
    );
    let metrics = PrometheusBuilder::new().build_recorder().handle();

    let router = create_router(AppState {
        engine,
        sync: Arc::clone(&sync),
        metrics,
    });
    (router, store, sync)
}

fn token() -> String {
    let claims = serde_json::json!({
        "user_id": 77,
        "username": "bob",
        "nickname": "Bob",
        "exp": chrono::Utc::now().timestamp() + 300,
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

fn verify_request(original_uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .uri("/auth/verify")
        .header("X-Forwarded-Uri", original_uri)
}

#[tokio::test]
async fn test_whitelisted_original_uri_is_allowed_without_identity() {
    let (app, _, _) = app_with("redirect").await;
    let response = app
        .oneshot(verify_request("/api/a/public/docs?page=2").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("X-User-Id").is_none());
}

#[tokio::test]
async fn test_dot_segment_original_uri_is_not_whitelisted() {
    for original_uri in ["/api/a/public/../private/admin", "/api/a/public/%2e%2e/private?x=1"] {
        let (app, _, _) = app_with("unauthorized").await;
        let response = app
            .oneshot(verify_request(original_uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{original_uri}");
    }
}

#[tokio::test]
async fn test_verified_credential_returns_identity_headers() {
    let (app, _, _) = app_with("redirect").await;
    let request = verify_request("/api/a/private")
        .header("Authorization", format!("Bearer {}", token()))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("X-User-Id").unwrap(), "77");
    assert_eq!(response.headers().get("X-User-Name").unwrap(), "bob");
    assert_eq!(response.headers().get("X-User-Nickname").unwrap(), "Bob");
}

#[tokio::test]
async fn test_cookie_credential_is_accepted() {
    let (app, _, _) = app_with("redirect").await;
    let request = verify_request("/api/a/private")
        .header("Cookie", format!("titan_gate_login={}", token()))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_credential_redirects_to_login_with_referer() {
    let (app, _, _) = app_with("redirect").await;
    let request = verify_request("/api/a/private")
        .header("Referer", "https://app.example.com/cart")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get(LOCATION).unwrap(),
        "https://login.example.com/?redirectUrl=https%3A%2F%2Fapp.example.com%2Fcart"
    );
}

#[tokio::test]
async fn test_invalid_credential_gets_401_in_unauthorized_mode() {
    let (app, _, _) = app_with("unauthorized").await;
    let request = verify_request("/api/a/private")
        .header("Authorization", "Bearer not-a-token")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_cleared_source_requires_credential_after_refresh() {
    let (app, store, sync) = app_with("redirect").await;
    store.clear_source("svc-a");
    sync.refresh_all().await.unwrap();

    let response = app
        .oneshot(verify_request("/api/a/public/docs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
}

#[tokio::test]
async fn test_health_reports_whitelist_status() {
    let (app, _, _) = app_with("redirect").await;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["whitelist"]["state"], "synchronized");
    assert_eq!(body["whitelist"]["patterns"], 3);
    assert_eq!(body["whitelist"]["sources"], 1);
}

#[tokio::test]
async fn test_metrics_endpoint_renders_text() {
    let (app, _, _) = app_with("redirect").await;
    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"].to_str().unwrap().starts_with("text/plain"));
}
