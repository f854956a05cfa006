//! SplitLedger Server
//!
//! Receives signed payment webhooks, records each payment once, splits it
//! among the configured beneficiaries and appends the result to the
//! hash-chained allocation ledger.
//!
//! # Features
//!
//! - HMAC-SHA256 webhook verification over the raw body
//! - PostgreSQL or in-memory storage, Redis or in-process idempotency
//! - Background retry worker with stale-attempt recovery
//! - Prometheus metrics export
//! - Graceful shutdown handling
//!
//! # Usage
//!
//! ```bash
//! # Start with default settings (in-memory, development)
//! splitledger-server --webhook-secret whsec_dev
//!
//! # Start with custom config
//! splitledger-server --config /path/to/config.toml
//!
//! # Start with environment overrides
//! SPLITLEDGER__SERVER__PORT=8080 splitledger-server
//! ```

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use splitledger_allocation::{
    AllocationEngine, HttpTransferSink, LoggingTransferSink, RetryScheduler, TransferSink,
};
use splitledger_api::{create_router, ApiConfig, AppState};
use splitledger_crypto::WebhookVerifier;
use splitledger_db::{
    IdempotencyGuard, IdempotencyStore, LedgerStore, MemoryIdempotencyStore, MemoryStore, PgStore,
    RedisIdempotencyStore, TransactionStore,
};

use crate::config::{Environment, ServerConfig, TransferKind};

// =============================================================================
// CLI Arguments
// =============================================================================

/// SplitLedger Server - payment webhook allocation ledger
#[derive(Parser, Debug)]
#[command(name = "splitledger-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, JSON, or YAML)
    #[arg(short, long, env = "SPLITLEDGER_CONFIG")]
    config: Option<String>,

    /// Host to bind to
    #[arg(long, env = "SPLITLEDGER_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "SPLITLEDGER_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SPLITLEDGER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (json, pretty)
    #[arg(long, env = "SPLITLEDGER_LOG_FORMAT")]
    log_format: Option<String>,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Payment processor webhook signing secret
    #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,

    /// Deployment environment (development, production)
    #[arg(long, env = "SPLITLEDGER_ENVIRONMENT")]
    environment: Option<String>,
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let mut server_config = ServerConfig::load(args.config.as_deref())?;
    apply_args(&mut server_config, args)?;

    // Initialize logging
    init_logging(&server_config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %server_config.environment,
        "Starting SplitLedger Server"
    );

    // Validate configuration
    for warning in server_config.validate()? {
        tracing::warn!("{}", warning);
    }

    // Start metrics server if enabled
    if server_config.metrics.enabled {
        start_metrics_server(&server_config.metrics)?;
    }

    // Initialize storage
    let store = init_store(&server_config).await?;
    let idempotency = init_idempotency(&server_config).await?;

    // Initialize allocation engine
    let sink = init_transfer_sink(&server_config)?;
    let engine = Arc::new(AllocationEngine::new(
        store.clone(),
        sink,
        server_config.allocation.engine_config(),
    )?);

    tracing::info!(
        beneficiaries = server_config.allocation.shares.len(),
        primary = %server_config.allocation.primary,
        max_attempts = server_config.allocation.max_attempts,
        "Allocation engine initialized"
    );

    // Start retry worker
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = RetryScheduler::new(engine.clone(), server_config.allocation.scheduler_config())
        .spawn(shutdown_rx);

    // Create application state
    let state = Arc::new(
        AppState::new(
            store,
            idempotency,
            WebhookVerifier::new(server_config.webhook.secret.clone()),
            engine,
        )
        .with_signature_header(&server_config.webhook.signature_header),
    );

    // Create API configuration
    let api_config = ApiConfig {
        enable_cors: server_config.api.enable_cors,
        cors_origins: server_config.api.cors_origins.clone(),
        enable_compression: server_config.api.enable_compression,
        enable_tracing: server_config.api.enable_tracing,
        max_body_size: server_config.api.max_body_size,
    };

    // Create router
    let app = create_router(state, api_config);

    // Get bind address
    let addr = server_config.server.socket_addr()?;

    tracing::info!(
        host = %server_config.server.host,
        port = %server_config.server.port,
        "Server listening"
    );

    // Start server with graceful shutdown
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the retry worker, letting a pass in progress finish
    let _ = shutdown_tx.send(true);
    let timeout = server_config.server.shutdown_timeout();
    if tokio::time::timeout(timeout, scheduler).await.is_err() {
        tracing::warn!(
            timeout_secs = timeout.as_secs(),
            "Retry worker did not stop in time; interrupted attempts will be recovered on restart"
        );
    }

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// CLI arguments take precedence over file and environment configuration
fn apply_args(config: &mut ServerConfig, args: Args) -> anyhow::Result<()> {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    if let Some(url) = args.database_url {
        match config.database.as_mut() {
            Some(database) => database.postgres_url = url,
            None => config.database = Some(splitledger_db::DatabaseConfig::new(url)),
        }
    }
    if let Some(url) = args.redis_url {
        config.redis = Some(crate::config::RedisConfig { url });
    }
    if let Some(secret) = args.webhook_secret {
        config.webhook.secret = Some(secret);
    }
    if let Some(environment) = args.environment {
        config.environment = environment.parse::<Environment>()?;
    }
    Ok(())
}

// =============================================================================
// Initialization Functions
// =============================================================================

/// Initialize tracing/logging
fn init_logging(config: &config::LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match config.format.as_str() {
        "json" => {
            subscriber
                .with(fmt::layer().json().with_target(true))
                .try_init()?;
        }
        _ => {
            subscriber
                .with(fmt::layer().pretty().with_target(true))
                .try_init()?;
        }
    }

    Ok(())
}

/// PostgreSQL when configured, otherwise in-memory
async fn init_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    match &config.database {
        Some(database) => {
            tracing::info!("Connecting to database...");
            let store = PgStore::connect(database).await?;
            store.ping().await?;
            tracing::info!("Database connected successfully");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No database configured; using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Redis-backed window when configured, otherwise in-process
async fn init_idempotency(config: &ServerConfig) -> anyhow::Result<IdempotencyGuard> {
    let store: Arc<dyn IdempotencyStore> = match &config.redis {
        Some(redis) => Arc::new(RedisIdempotencyStore::connect(&redis.url).await?),
        None => Arc::new(MemoryIdempotencyStore::new()),
    };

    Ok(IdempotencyGuard::new(
        store,
        config.webhook.idempotency_ttl(),
        config.webhook.idempotency_max_entries,
    ))
}

fn init_transfer_sink(config: &ServerConfig) -> anyhow::Result<Arc<dyn TransferSink>> {
    match config.transfer.kind {
        TransferKind::Log => {
            tracing::info!("Using logging transfer sink");
            Ok(Arc::new(LoggingTransferSink::new()))
        }
        TransferKind::Http => {
            let endpoint = config
                .transfer
                .base_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("transfer.base_url is not set"))?;
            tracing::info!(endpoint = %endpoint, "Using HTTP transfer sink");
            Ok(Arc::new(HttpTransferSink::new(
                endpoint,
                config.allocation.transfer_timeout(),
            )?))
        }
    }
}

/// Start Prometheus metrics server
fn start_metrics_server(config: &config::MetricsConfig) -> anyhow::Result<()> {
    if let Some(port) = config.port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        tracing::info!(port = port, "Starting metrics server");

        // The exporter serves scrapes from a background task
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;

        describe_metrics();
    }

    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(
        "splitledger_webhooks_total",
        "Webhook deliveries by outcome"
    );
    metrics::describe_counter!(
        "splitledger_allocations_completed_total",
        "Allocations appended to the ledger"
    );
    metrics::describe_counter!(
        "splitledger_allocations_failed_total",
        "Failed allocation attempts"
    );
    metrics::describe_counter!(
        "splitledger_allocations_terminal_failed_total",
        "Allocations needing manual intervention"
    );
    metrics::describe_histogram!(
        "splitledger_transfer_seconds",
        metrics::Unit::Seconds,
        "Transfer call latency"
    );
}

// =============================================================================
// Graceful Shutdown
// =============================================================================

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let args = Args::parse_from(["splitledger-server", "--port", "8080"]);
        assert_eq!(args.port, Some(8080));
    }

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from([
            "splitledger-server",
            "--database-url",
            "postgres://u:p@db/splitledger",
            "--webhook-secret",
            "whsec_cli",
            "--environment",
            "production",
        ]);
        let mut config = ServerConfig::default();
        apply_args(&mut config, args).unwrap();

        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.webhook.secret.as_deref(), Some("whsec_cli"));
        assert_eq!(
            config.database.unwrap().postgres_url,
            "postgres://u:p@db/splitledger"
        );
    }

    #[test]
    fn test_invalid_environment_argument() {
        let args = Args::parse_from(["splitledger-server", "--environment", "staging"]);
        assert!(apply_args(&mut ServerConfig::default(), args).is_err());
    }

    #[tokio::test]
    async fn test_log_sink_selected_by_default() {
        assert!(init_transfer_sink(&ServerConfig::default()).is_ok());
        let guard = init_idempotency(&ServerConfig::default()).await.unwrap();
        assert_eq!(guard.ttl(), chrono::Duration::hours(24));
    }
}
