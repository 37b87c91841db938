use anyhow::{Context, Result};
use auth_gateway::{AdmissionConfig, GatewayConfig, StoreConfig, TokenConfig, WhitelistConfig};
use serde::Deserialize;
use std::path::Path;

/// Environment variable prefix, e.g. `GATEWAY__STORE__REDIS_URL`
pub const ENV_PREFIX: &str = "GATEWAY";

/// Process settings: listener plus the gateway sections
#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    pub token: TokenConfig,

    #[serde(default)]
    pub whitelist: WhitelistConfig,

    #[serde(default)]
    pub store: StoreConfig,

    pub admission: AdmissionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Settings {
    /// Load settings from an optional file at `path`, then `GATEWAY__*`
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Fails if a source cannot be parsed, a required section is missing, or
    /// the resulting gateway configuration does not validate.
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // GATEWAY__WHITELIST__STATIC_URLS=/health,/metrics
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("whitelist.static_urls"),
        );

        let settings: Settings = builder
            .build()
            .context("Failed to read gateway settings")?
            .try_deserialize()
            .context("Invalid gateway settings")?;

        settings.validate()?;
        Ok(settings)
    }

    /// # Errors
    ///
    /// Fails if the listener port is zero.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be positive");
        }
        Ok(())
    }

    /// Split into listener settings and the validated library configuration
    ///
    /// # Errors
    ///
    /// Returns the first gateway configuration invariant that does not hold.
    pub fn into_parts(self) -> Result<(ServerSettings, GatewayConfig)> {
        let gateway = GatewayConfig {
            token: self.token,
            whitelist: self.whitelist,
            store: self.store,
            admission: self.admission,
        };
        gateway.validate().context("Invalid gateway configuration")?;
        Ok((self.server, gateway))
    }
}
