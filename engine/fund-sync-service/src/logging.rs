//! Logging and tracing setup

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize logging; `RUST_LOG` overrides the configured level
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn initialize_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let fmt_layer = match config.format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        "compact" => fmt::layer().compact().with_writer(std::io::stderr).with_target(false).boxed(),
        _ => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_ansi(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}
