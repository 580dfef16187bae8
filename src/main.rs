use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::{FloodgateConfig, StoreBackend};
use floodgate::http::{HttpServer, RateLimitState};
use floodgate::ratelimit::{
    MemoryStore, PlanRegistry, RateLimitStore, RateLimiter, RedisStore, RuleCatalog,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Per-client, per-route HTTP rate limiting server.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the state store backend (memory or redis)
    #[arg(long)]
    store: Option<StoreBackend>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    match cli.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    info!("Starting Floodgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = FloodgateConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(store) = cli.store {
        config.store.backend = store;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.store.backend,
        failure_policy = ?config.rate_limiting.failure_policy,
        "Configuration loaded"
    );

    let rules = match &config.rate_limiting.rules_path {
        Some(path) => RuleCatalog::from_file(path)?,
        None => {
            let rules = RuleCatalog::default();
            rules.validate()?;
            rules
        }
    };
    let plans = match &config.rate_limiting.plans_path {
        Some(path) => PlanRegistry::from_file(path)?,
        None => {
            warn!("No plan registry configured, using built-in demo keys");
            PlanRegistry::default()
        }
    };
    info!(
        routes = rules.routes.len(),
        api_keys = plans.len(),
        "Rate limit rules loaded"
    );

    let store: Arc<dyn RateLimitStore> = match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory state store");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis => {
            info!(redis_url = %config.store.redis_url, "Using Redis state store");
            let store =
                RedisStore::connect_with_prefix(&config.store.redis_url, &config.store.key_prefix)
                    .await?;
            store.ping().await?;
            Arc::new(store)
        }
    };

    let limiter = RateLimiter::new(store);
    let state = RateLimitState::new(limiter, rules, plans)
        .with_failure_policy(config.rate_limiting.failure_policy);

    let server = HttpServer::new(config.server.listen_addr, state);
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Floodgate Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
