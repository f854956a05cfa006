//! Server Configuration
//!
//! Configuration management for the SplitLedger server.
//! Supports environment variables, config files, and CLI arguments.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use splitledger_allocation::{EngineConfig, SchedulerConfig};
use splitledger_api::DEFAULT_SIGNATURE_HEADER;
use splitledger_db::DatabaseConfig;
use splitledger_types::{BeneficiaryShare, SplitConfig, DEFAULT_MAX_ATTEMPTS};

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => anyhow::bail!("unknown environment: {other}"),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => f.write_str("development"),
            Self::Production => f.write_str("production"),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub environment: Environment,

    /// Server binding configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// PostgreSQL (optional; in-memory store when absent)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Redis configuration (optional; in-process idempotency when absent)
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Webhook verification and deduplication
    #[serde(default)]
    pub webhook: WebhookSettings,

    /// Split and retry policy
    #[serde(default)]
    pub allocation: AllocationSettings,

    /// Payout sink
    #[serde(default)]
    pub transfer: TransferSettings,

    /// HTTP middleware
    #[serde(default)]
    pub api: ApiSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Server binding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Grace period for in-flight work on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ServerSettings {
    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address {}:{}: {}", self.host, self.port, e))
    }

    /// Get the shutdown timeout duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

/// Webhook settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Processor signing secret; required in production
    #[serde(default)]
    pub secret: Option<String>,

    /// Header carrying the base64 HMAC-SHA256 signature
    #[serde(default = "default_signature_header")]
    pub signature_header: String,

    /// How long a processed payment id is remembered
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_secs: u64,

    /// Entry count that triggers a sweep of expired ids
    #[serde(default = "default_idempotency_max_entries")]
    pub idempotency_max_entries: usize,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            secret: None,
            signature_header: default_signature_header(),
            idempotency_ttl_secs: default_idempotency_ttl(),
            idempotency_max_entries: default_idempotency_max_entries(),
        }
    }
}

impl WebhookSettings {
    pub fn has_secret(&self) -> bool {
        self.secret.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn idempotency_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idempotency_ttl_secs as i64)
    }
}

/// One configured beneficiary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareSettings {
    pub name: String,
    pub percent: Decimal,
    pub account_ref: String,
}

/// Allocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationSettings {
    /// Beneficiaries in payout order
    #[serde(default = "default_shares")]
    pub shares: Vec<ShareSettings>,

    /// Share receiving the rounding remainder
    #[serde(default = "default_primary")]
    pub primary: String,

    /// Attempts before an allocation fails terminally
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound on a single transfer call
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,

    /// Retry scheduler period
    #[serde(default = "default_retry_poll_interval")]
    pub retry_poll_interval_secs: u64,

    /// Idle time after which an in-flight attempt counts as interrupted
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Allocations resumed per status per scheduler pass
    #[serde(default = "default_retry_batch_size")]
    pub retry_batch_size: usize,
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            shares: default_shares(),
            primary: default_primary(),
            max_attempts: default_max_attempts(),
            transfer_timeout_secs: default_transfer_timeout(),
            retry_poll_interval_secs: default_retry_poll_interval(),
            stale_after_secs: default_stale_after(),
            retry_batch_size: default_retry_batch_size(),
        }
    }
}

impl AllocationSettings {
    pub fn split_config(&self) -> SplitConfig {
        SplitConfig {
            shares: self
                .shares
                .iter()
                .map(|s| BeneficiaryShare {
                    name: s.name.clone(),
                    percent: s.percent,
                    account_ref: s.account_ref.clone(),
                })
                .collect(),
            primary: self.primary.clone(),
        }
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new(self.split_config())
            .with_max_attempts(self.max_attempts)
            .with_transfer_timeout(self.transfer_timeout())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.retry_poll_interval_secs),
            stale_after: chrono::Duration::seconds(self.stale_after_secs as i64),
            batch_size: self.retry_batch_size,
        }
    }
}

/// Payout sink kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    /// Log each payout (development)
    #[default]
    Log,
    /// POST each payout to `base_url`
    Http,
}

/// Transfer sink settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default)]
    pub kind: TransferKind,

    /// Payout endpoint for the `http` sink
    #[serde(default)]
    pub base_url: Option<String>,
}

/// API middleware settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Enable CORS
    #[serde(default)]
    pub enable_cors: bool,

    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Enable response compression
    #[serde(default = "default_true")]
    pub enable_compression: bool,

    /// Enable request tracing
    #[serde(default = "default_true")]
    pub enable_tracing: bool,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            enable_cors: false,
            cors_origins: Vec::new(),
            enable_compression: true,
            enable_tracing: true,
            max_body_size: default_max_body_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Exporter port
    #[serde(default = "default_metrics_port")]
    pub port: Option<u16>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_signature_header() -> String {
    DEFAULT_SIGNATURE_HEADER.to_string()
}

fn default_idempotency_ttl() -> u64 {
    24 * 60 * 60
}

fn default_idempotency_max_entries() -> usize {
    10_000
}

fn default_shares() -> Vec<ShareSettings> {
    [("operations", 70), ("reserve", 20), ("founder", 10)]
        .into_iter()
        .map(|(name, percent)| ShareSettings {
            name: name.to_string(),
            percent: Decimal::from(percent),
            account_ref: format!("acct_{name}"),
        })
        .collect()
}

fn default_primary() -> String {
    "operations".to_string()
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_transfer_timeout() -> u64 {
    30
}

fn default_retry_poll_interval() -> u64 {
    30
}

fn default_stale_after() -> u64 {
    600
}

fn default_retry_batch_size() -> usize {
    100
}

fn default_max_body_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_metrics_port() -> Option<u16> {
    Some(9090)
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Configuration Loading
// =============================================================================

impl ServerConfig {
    /// Load configuration from environment and optional config file
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();

        // Add config file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        // Add default config locations
        builder = builder
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false));

        // Add environment variables with SPLITLEDGER_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("SPLITLEDGER")
                .separator("__")
                .try_parsing(true),
        );

        let server_config: ServerConfig = builder.build()?.try_deserialize()?;
        Ok(server_config)
    }

    /// Reject configurations the server must not start with.
    ///
    /// Returns the non-fatal problems so the caller can log them once
    /// logging is up.
    pub fn validate(&self) -> anyhow::Result<Vec<String>> {
        let mut warnings = Vec::new();

        self.allocation
            .split_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("allocation split: {e}"))?;

        if self.allocation.max_attempts == 0 {
            anyhow::bail!("allocation.max_attempts must be at least 1");
        }
        if self.allocation.transfer_timeout_secs == 0 {
            anyhow::bail!("allocation.transfer_timeout_secs must be positive");
        }

        if !self.webhook.has_secret() {
            match self.environment {
                Environment::Production => anyhow::bail!(
                    "Webhook signing secret must be set in production. Set SPLITLEDGER__WEBHOOK__SECRET."
                ),
                Environment::Development => warnings.push(
                    "Webhook signing secret not set; webhooks will be refused with 503".to_string(),
                ),
            }
        }

        if self.transfer.kind == TransferKind::Http && self.transfer.base_url.is_none() {
            anyhow::bail!("transfer.base_url is required for the http transfer sink");
        }

        if self.environment == Environment::Production {
            if self.database.is_none() {
                warnings.push("No database configured; records are kept in memory only".to_string());
            }
            if self.transfer.kind == TransferKind::Log {
                warnings.push("Log transfer sink in production; no payouts will be made".to_string());
            }
        }

        Ok(warnings)
    }
}
