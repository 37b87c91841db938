//! Request interception for axum
//!
//! Runs the admission engine in front of every route. Whitelisted and
//! authenticated requests continue down the stack; everything else gets the
//! configured denial response.

use crate::admission::{Admission, AdmissionEngine, Denial};
use axum::{
    extract::{Request, State},
    http::{header::LOCATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Admission middleware; use with `axum::middleware::from_fn_with_state`
pub async fn admission_middleware(
    State(engine): State<Arc<AdmissionEngine>>,
    request: Request,
    next: Next,
) -> Response {
    match engine.admit(request) {
        Admission::Forward(request) => next.run(request).await,
        Admission::Deny(denial) => denial.into_response(),
    }
}

impl IntoResponse for Denial {
    fn into_response(self) -> Response {
        match self {
            Denial::Redirect { location } => (StatusCode::FOUND, [(LOCATION, location)]).into_response(),
            Denial::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdmissionConfig, DenialMode, TokenConfig};
    use crate::pattern::compile;
    use crate::ruleset::Ruleset;
    use crate::sync::RulesetSource;
    use crate::tokens::test_support::{valid_token, SECRET};
    use crate::tokens::{IdentityClaims, JwtVerifier};
    use axum::{body::Body, routing::get, Extension, Router};
    use http::header::AUTHORIZATION;
    use secrecy::SecretString;
    use tower::ServiceExt;

    struct FixedRules(Arc<Ruleset>);

    impl RulesetSource for FixedRules {
        fn current_ruleset(&self) -> Arc<Ruleset> {
            Arc::clone(&self.0)
        }
    }

    fn app(denial_mode: DenialMode) -> Router {
        let rules = Arc::new(FixedRules(Arc::new(Ruleset::new(
            vec![Arc::new(compile("/public/**").unwrap())],
            1,
        ))));
        let verifier = JwtVerifier::new(&TokenConfig {
            secret: SecretString::new(SECRET.to_string()),
            algorithm: "HS256".to_string(),
            leeway_seconds: 0,
            require_expiry: true,
            issuer: None,
            audience: None,
        })
        .unwrap();
        let mut config: AdmissionConfig = serde_json::from_value(serde_json::json!({
            "login_url": "https://login.example.com/",
            "default_home_url": "https://app.example.com/"
        }))
        .unwrap();
        config.denial_mode = denial_mode;
        let engine = Arc::new(AdmissionEngine::new(rules, Arc::new(verifier), &config).unwrap());

        Router::new()
            .route("/public/info", get(|| async { "public" }))
            .route(
                "/private",
                get(|claims: Option<Extension<IdentityClaims>>| async move {
                    claims.map(|Extension(c)| c.username).unwrap_or_default()
                }),
            )
            .layer(axum::middleware::from_fn_with_state(engine, admission_middleware))
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_whitelisted_route_passes_through() {
        let response = app(DenialMode::Redirect)
            .oneshot(http::Request::builder().uri("/public/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "public");
    }

    #[tokio::test]
    async fn test_protected_route_redirects_without_credential() {
        let response = app(DenialMode::Redirect)
            .oneshot(http::Request::builder().uri("/private").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://login.example.com/?redirectUrl=https%3A%2F%2Fapp.example.com%2F"
        );
    }

    #[tokio::test]
    async fn test_protected_route_returns_401_in_unauthorized_mode() {
        let response = app(DenialMode::Unauthorized)
            .oneshot(http::Request::builder().uri("/private").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(LOCATION).is_none());
    }

    #[tokio::test]
    async fn test_authenticated_request_reaches_handler_with_claims() {
        let request = http::Request::builder()
            .uri("/private")
            .header(AUTHORIZATION, format!("Bearer {}", valid_token()))
            .body(Body::empty())
            .unwrap();
        let response = app(DenialMode::Redirect).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "alice");
    }
}
