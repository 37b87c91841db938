use crate::error::{GatewayError, Result};
use http::HeaderName;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main gateway configuration
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    /// Credential verification settings
    pub token: TokenConfig,

    /// Static baseline and refresh cadence
    #[serde(default)]
    pub whitelist: WhitelistConfig,

    /// External whitelist store connection and key layout
    #[serde(default)]
    pub store: StoreConfig,

    /// What to do with requests that are not whitelisted
    pub admission: AdmissionConfig,
}

/// JWT verification configuration
#[derive(Debug, Deserialize)]
pub struct TokenConfig {
    /// Pre-shared HMAC secret
    pub secret: SecretString,

    /// HMAC algorithm (HS256, HS384, HS512)
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Clock skew tolerated on `exp`/`nbf`, in seconds
    #[serde(default = "default_leeway")]
    pub leeway_seconds: u64,

    /// Reject tokens without an `exp` claim. An `exp` that is present is
    /// always enforced.
    #[serde(default)]
    pub require_expiry: bool,

    /// Expected `iss` claim, if any
    pub issuer: Option<String>,

    /// Expected `aud` claim, if any
    pub audience: Option<String>,
}

/// Whitelist baseline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhitelistConfig {
    /// Path specifications that never require a credential
    #[serde(default)]
    pub static_urls: Vec<String>,

    /// Backstop full resync interval in seconds (default: 60)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Window for coalescing bursts of notifications, in milliseconds
    #[serde(default = "default_debounce")]
    pub notification_debounce_ms: u64,
}

/// Whitelist store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Set-valued key enumerating all registered sources
    #[serde(default = "default_registry_key")]
    pub registry_key: String,

    /// Prefix of the per-source set keys
    #[serde(default = "default_source_key_prefix")]
    pub source_key_prefix: String,

    /// Bound on every store call, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    /// Also listen to Redis keyspace notifications for the whitelist keys
    #[serde(default)]
    pub keyspace_events: bool,

    /// Delay before re-establishing a dropped notification connection
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

/// Response policy for requests that are neither whitelisted nor authenticated
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DenialMode {
    /// 302 to the login page carrying the intended destination
    #[default]
    Redirect,
    /// Bare 401
    Unauthorized,
}

/// Admission configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    /// Login page the caller is redirected to
    pub login_url: String,

    /// Destination used when the request carries no usable Referer
    pub default_home_url: String,

    /// Query parameter carrying the post-login destination
    #[serde(default = "default_redirect_param")]
    pub redirect_param: String,

    /// Cookie consulted when no Authorization header is present
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    #[serde(default)]
    pub denial_mode: DenialMode,

    #[serde(default)]
    pub identity_headers: IdentityHeaderNames,
}

/// Header names used to forward identity to backends
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityHeaderNames {
    #[serde(default = "default_user_id_header")]
    pub user_id: String,

    #[serde(default = "default_username_header")]
    pub username: String,

    #[serde(default = "default_display_name_header")]
    pub display_name: String,
}

impl GatewayConfig {
    /// Check invariants that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.token.secret.expose_secret().is_empty() {
            return Err(invalid("token.secret must not be empty"));
        }
        if !matches!(self.token.algorithm.as_str(), "HS256" | "HS384" | "HS512") {
            return Err(invalid(format!(
                "token.algorithm '{}' is not an HMAC algorithm",
                self.token.algorithm
            )));
        }
        if self.whitelist.refresh_interval_secs == 0 {
            return Err(invalid("whitelist.refresh_interval_secs must be positive"));
        }
        if self.store.timeout_ms == 0 {
            return Err(invalid("store.timeout_ms must be positive"));
        }
        if self.store.registry_key.is_empty() || self.store.source_key_prefix.is_empty() {
            return Err(invalid("store key layout must not be empty"));
        }
        if self.admission.denial_mode == DenialMode::Redirect && self.admission.login_url.is_empty() {
            return Err(invalid("admission.login_url is required in redirect mode"));
        }
        if self.admission.redirect_param.is_empty() {
            return Err(invalid("admission.redirect_param must not be empty"));
        }
        self.admission.identity_headers.parse()?;
        Ok(())
    }
}

impl WhitelistConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn notification_debounce(&self) -> Duration {
        Duration::from_millis(self.notification_debounce_ms)
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl IdentityHeaderNames {
    /// Parse the configured names into header names.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidConfig`] if a name is not a valid header name.
    pub fn parse(&self) -> Result<[HeaderName; 3]> {
        let parse = |name: &str| {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| invalid(format!("'{name}' is not a valid header name")))
        };
        Ok([
            parse(&self.user_id)?,
            parse(&self.username)?,
            parse(&self.display_name)?,
        ])
    }
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            static_urls: Vec::new(),
            refresh_interval_secs: default_refresh_interval(),
            notification_debounce_ms: default_debounce(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            registry_key: default_registry_key(),
            source_key_prefix: default_source_key_prefix(),
            timeout_ms: default_store_timeout(),
            keyspace_events: false,
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

impl Default for IdentityHeaderNames {
    fn default() -> Self {
        Self {
            user_id: default_user_id_header(),
            username: default_username_header(),
            display_name: default_display_name_header(),
        }
    }
}

fn invalid(message: impl Into<String>) -> GatewayError {
    GatewayError::InvalidConfig(message.into())
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

fn default_leeway() -> u64 {
    30
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_debounce() -> u64 {
    50
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_registry_key() -> String {
    "ignorable_urls:keys".to_string()
}

fn default_source_key_prefix() -> String {
    "ignorable_urls:service:".to_string()
}

fn default_store_timeout() -> u64 {
    2000
}

fn default_reconnect_delay() -> u64 {
    1000
}

fn default_redirect_param() -> String {
    "redirectUrl".to_string()
}

fn default_cookie_name() -> String {
    "titan_gate_login".to_string()
}

fn default_user_id_header() -> String {
    "X-User-Id".to_string()
}

fn default_username_header() -> String {
    "X-User-Name".to_string()
}

fn default_display_name_header() -> String {
    "X-User-Nickname".to_string()
}
