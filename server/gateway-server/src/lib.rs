//! Aerial gateway server
//!
//! Process wiring around `auth-gateway`: settings loading, tracing and
//! metrics initialisation, and the forward-auth HTTP surface used by
//! external proxies (`/auth/verify`, `/health`, `/metrics`).

pub mod routes;
pub mod settings;
pub mod telemetry;

pub use routes::{create_router, AppState};
pub use settings::{ServerSettings, Settings};
