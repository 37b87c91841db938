//! Logging and metrics initialisation

use anyhow::{Context, Result};
use colored::Colorize;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::env;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins when set. `GATEWAY_ENV=production` switches to JSON
/// lines; anything else gets human-readable output, coloured when stdout is
/// a terminal and `NO_COLOR` is unset.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let is_development = env::var("GATEWAY_ENV").unwrap_or_else(|_| "development".to_string()) != "production";
    let use_colors = env::var("NO_COLOR").is_err() && atty::is(atty::Stream::Stdout);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("gateway_server={level},auth_gateway={level},tower_http=info,redis=warn").into()
    });

    if is_development {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(use_colors)
                    .with_level(true),
            )
            .try_init()
            .context("Failed to install tracing subscriber")?;

        if use_colors {
            print_startup_banner();
        }
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(())
}

/// Install the Prometheus recorder behind the `metrics` facade
///
/// # Errors
///
/// Fails if a global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

fn print_startup_banner() {
    println!("{}", "╔══════════════════════════════════════════════════════════════╗".bright_cyan());
    println!("{}", "║                      🛡️  AERIAL GATEWAY                       ║".bright_cyan());
    println!("{}", "║             Whitelist sync and request admission             ║".bright_cyan());
    println!("{}", "╚══════════════════════════════════════════════════════════════╝".bright_cyan());
    println!();
}
