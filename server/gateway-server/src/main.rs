use anyhow::{Context, Result};
use auth_gateway::{
    AdmissionEngine, JwtVerifier, RedisWhitelistStore, RulesetSource, SyncOptions,
    WhitelistSynchronizer,
};
use clap::Parser;
use colored::Colorize;
use gateway_server::{create_router, telemetry, AppState, Settings};
use std::sync::Arc;
use tracing::{info, warn};

/// Aerial gateway server
#[derive(Parser, Debug)]
#[command(name = "gateway-server")]
#[command(about = "Forward-auth gateway with a dynamically synchronized whitelist")]
struct Args {
    /// Server bind address (overrides the settings file)
    #[arg(long, env = "GATEWAY_HOST")]
    host: Option<String>,

    /// Server port (overrides the settings file)
    #[arg(short, long, env = "GATEWAY_PORT")]
    port: Option<u16>,

    /// Configuration file path
    #[arg(short, long, default_value = "gateway.yaml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    telemetry::init_tracing(args.verbose)?;
    let metrics = telemetry::init_metrics()?;

    info!("🛡️  {}", "Starting Aerial gateway".bright_cyan());
    info!("📋 Version: {}", env!("CARGO_PKG_VERSION").bright_white());

    let settings = Settings::load(&args.config)
        .with_context(|| format!("Failed to load settings from {}", args.config))?;
    let (mut server, config) = settings.into_parts()?;
    if let Some(host) = args.host {
        server.host = host;
    }
    if let Some(port) = args.port {
        server.port = port;
    }

    info!("🔐 {}", "Initializing credential verifier...".bright_cyan());
    let verifier = Arc::new(JwtVerifier::new(&config.token)?);

    info!(
        "📦 Whitelist store: {} (registry '{}')",
        config.store.redis_url.bright_yellow(),
        config.store.registry_key
    );
    let store = Arc::new(RedisWhitelistStore::new(&config.store).context("Invalid Redis URL")?);
    if let Err(err) = store.ping().await {
        warn!("⚠️  Whitelist store not reachable yet: {}", err);
    }

    let sync = Arc::new(WhitelistSynchronizer::new(store, SyncOptions::from_config(&config)));
    let sync_handle = sync.start().await;

    let status = sync.status();
    info!(
        "✅ Whitelist ready: {} patterns, state {:?}",
        status.patterns, status.state
    );

    let rules = Arc::clone(&sync) as Arc<dyn RulesetSource>;
    let engine = Arc::new(AdmissionEngine::new(rules, verifier, &config.admission)?);

    let app = create_router(AppState {
        engine,
        sync,
        metrics,
    });

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!("🚀 {}", format!("Gateway listening on http://{addr}").bright_green());
    info!("📋 {}", format!("Forward-auth endpoint: http://{addr}/auth/verify").bright_blue());
    info!("📋 {}", format!("Health check: http://{addr}/health").bright_blue());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    sync_handle.shutdown();
    info!("👋 {}", "Gateway stopped".bright_white());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("🛑 Shutdown signal received, draining connections");
}
