//! Authentication boundary for the Aerial gateway
//!
//! Decides, before a request reaches any backend, whether it may proceed
//! unauthenticated (whitelisted path), must carry a valid bearer credential,
//! or is sent to the login flow.
//!
//! # Components
//!
//! - [`tokens`]: HMAC JWT verification and identity claims
//! - [`pattern`]: whitelist specification compiler
//! - [`store`]: Redis (and in-memory) whitelist store with change notifications
//! - [`sync`]: keeps the published [`Ruleset`] in step with the store
//! - [`admission`]: per-request decision engine
//! - [`middleware`]: axum interception layer
//!
//! # Example
//!
//! ```rust,no_run
//! use auth_gateway::{
//!     admission_middleware, AdmissionEngine, GatewayConfig, JwtVerifier,
//!     RedisWhitelistStore, SyncOptions, WhitelistSynchronizer,
//! };
//! use axum::{middleware, routing::get, Router};
//! use std::sync::Arc;
//!
//! # async fn run(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RedisWhitelistStore::new(&config.store)?);
//! let sync = Arc::new(WhitelistSynchronizer::new(store, SyncOptions::from_config(&config)));
//! let _handle = sync.start().await;
//!
//! let verifier = Arc::new(JwtVerifier::new(&config.token)?);
//! let engine = Arc::new(AdmissionEngine::new(sync, verifier, &config.admission)?);
//!
//! let app: Router = Router::new()
//!     .route("/orders", get(|| async { "orders" }))
//!     .layer(middleware::from_fn_with_state(engine, admission_middleware));
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod error;
pub mod middleware;
pub mod pattern;
pub mod ruleset;
pub mod store;
pub mod sync;
pub mod tokens;

pub use admission::{
    canonical_path, extract_credential, Admission, AdmissionEngine, Denial, Identity, Verdict,
};
pub use config::{
    AdmissionConfig, DenialMode, GatewayConfig, IdentityHeaderNames, StoreConfig, TokenConfig,
    WhitelistConfig,
};
pub use error::{CompileError, GatewayError, Result, StoreError, VerificationError, VerificationFailure};
pub use middleware::admission_middleware;
pub use pattern::{compile, Matcher, PathPattern};
pub use ruleset::Ruleset;
pub use store::{
    InMemoryWhitelistStore, RedisWhitelistStore, StoreLayout, Subscription, WhitelistEvent,
    WhitelistStore,
};
pub use sync::{RulesetSource, SyncHandle, SyncOptions, SyncState, SyncStatus, WhitelistSynchronizer};
pub use tokens::{CredentialVerifier, IdentityClaims, JwtVerifier};
