//! Service configuration management

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use account_sync::{FetcherConfig, SyncConfig};
use capital_classifier::ClassifierConfig;
use health_watchdog::WatchdogConfig;
use ledger::DatabaseConfig;
use terminal_broker::BrokerConfig;

/// Prefix of environment overrides, e.g. `FUND_SYNC__SYNC__INTERVAL_SECS=120`
pub const ENV_PREFIX: &str = "FUND_SYNC";

/// Main service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service-level configuration
    pub service: ServiceSettings,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Postgres ledger
    pub database: DatabaseConfig,

    /// Terminal endpoints and bridge call limits
    pub broker: BrokerConfig,

    pub sync: SyncConfig,

    pub classifier: ClassifierConfig,

    pub watchdog: WatchdogConfig,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Static account roster (TOML)
    pub roster_path: PathBuf,

    /// Fallback prefix for password variables of accounts without `password_env`
    pub credential_prefix: String,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            roster_path: PathBuf::from("./roster.toml"),
            credential_prefix: account_sync::EnvCredentials::DEFAULT_PREFIX.to_string(),
            shutdown_timeout_secs: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

impl ServiceSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Load configuration from an optional TOML file and `FUND_SYNC__*` environment variables
pub fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let mut builder = Config::builder();

    if let Some(path) = path {
        tracing::debug!("Loading configuration from file: {:?}", path);
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true));

    let config: ServiceConfig = builder
        .build()
        .context("Failed to read configuration sources")?
        .try_deserialize()
        .context("Failed to deserialize service configuration")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration
pub fn validate_config(config: &ServiceConfig) -> Result<()> {
    // Validate log level
    match config.logging.level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow!("Invalid log level: {}", config.logging.level)),
    }

    // Validate log format
    match config.logging.format.as_str() {
        "json" | "pretty" | "compact" => {}
        _ => return Err(anyhow!("Invalid log format: {}", config.logging.format)),
    }

    if config.sync.interval_secs == 0 {
        return Err(anyhow!("sync.interval_secs must be greater than zero"));
    }
    if config.sync.account_timeout_secs == 0 {
        return Err(anyhow!("sync.account_timeout_secs must be greater than zero"));
    }
    if config.sync.escalation_threshold == 0 {
        return Err(anyhow!("sync.escalation_threshold must be at least 1"));
    }
    if !config.sync.fetcher.lookback_in_range() {
        return Err(anyhow!(
            "sync.fetcher.initial_lookback_days must be within 1..={}, got {}",
            FetcherConfig::MAX_LOOKBACK_DAYS,
            config.sync.fetcher.initial_lookback_days
        ));
    }
    if config.broker.call_timeout_secs == 0 {
        return Err(anyhow!("broker.call_timeout_secs must be greater than zero"));
    }
    if config.broker.login_retry.max_attempts == 0 || config.sync.fetcher.read_retry.max_attempts == 0 {
        return Err(anyhow!("retry max_attempts must be at least 1"));
    }

    let mut servers = HashSet::new();
    for terminal in &config.broker.terminals {
        if !servers.insert(terminal.server.as_str()) {
            return Err(anyhow!("Terminal for server {} is configured twice", terminal.server));
        }
    }

    let watchdog = &config.watchdog;
    if watchdog.check_interval_secs == 0 {
        return Err(anyhow!("watchdog.check_interval_secs must be greater than zero"));
    }
    if watchdog.degraded_checks_before_healing == 0 {
        return Err(anyhow!("watchdog.degraded_checks_before_healing must be at least 1"));
    }
    if !(0.0..=1.0).contains(&watchdog.min_coverage) {
        return Err(anyhow!("watchdog.min_coverage must be within [0, 1], got {}", watchdog.min_coverage));
    }
    if watchdog.backoff_multiplier < 1.0 {
        return Err(anyhow!("watchdog.backoff_multiplier must be at least 1.0"));
    }
    if watchdog.max_cooldown_secs < watchdog.healing_cooldown_secs {
        return Err(anyhow!("watchdog.max_cooldown_secs is below watchdog.healing_cooldown_secs"));
    }

    Ok(())
}
