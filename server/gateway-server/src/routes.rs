use auth_gateway::{AdmissionEngine, SyncState, SyncStatus, Verdict, WhitelistSynchronizer};
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, HeaderName, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Original request path set by Traefik `forwardAuth`
pub const X_FORWARDED_URI: HeaderName = HeaderName::from_static("x-forwarded-uri");
/// Original request URI set by nginx `auth_request` setups
pub const X_ORIGINAL_URI: HeaderName = HeaderName::from_static("x-original-uri");

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AdmissionEngine>,
    pub sync: Arc<WhitelistSynchronizer>,
    pub metrics: PrometheusHandle,
}

/// Build the gateway's HTTP surface
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/verify", any(verify))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Forward-auth check for an external proxy.
///
/// Allowed requests get `200` (with identity headers when a credential was
/// verified); everything else gets the configured denial.
pub async fn verify(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
    let path = original_path(&headers).unwrap_or_else(|| uri.path().to_string());

    match state.engine.evaluate(&path, &headers) {
        Verdict::Whitelisted => StatusCode::OK.into_response(),
        Verdict::Authenticated(identity) => (StatusCode::OK, identity.headers).into_response(),
        Verdict::Denied(denial) => denial.into_response(),
    }
}

/// Path of the proxied request, without its query string
fn original_path(headers: &HeaderMap) -> Option<String> {
    [X_FORWARDED_URI, X_ORIGINAL_URI].iter().find_map(|name| {
        let value = headers.get(name)?.to_str().ok()?.trim();
        let path = value.split(['?', '#']).next().unwrap_or_default();
        path.starts_with('/').then(|| path.to_string())
    })
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub whitelist: SyncStatus,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let whitelist = state.sync.status();
    let status = match whitelist.state {
        SyncState::Synchronized => "healthy",
        // Serving with the baseline only
        SyncState::Uninitialized => "degraded",
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        whitelist,
    })
}

pub async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
