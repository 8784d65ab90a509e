//! Fund Sync Service Library
//!
//! Configuration, roster seeding, component wiring and graceful shutdown for the
//! `fund-sync` binary.

use anyhow::{Context, Result};
use std::path::Path;

pub mod cli;
pub mod config;
pub mod logging;
pub mod roster;
pub mod service;
pub mod signals;
pub mod status;

pub use config::{LoggingConfig, ServiceConfig, ServiceSettings};
pub use logging::initialize_logging;
pub use roster::{Roster, RosterEntry, SeedSummary};
pub use service::FundSyncService;
pub use signals::{graceful_shutdown, setup_signal_handlers, wait_for_shutdown};
pub use status::{AccountStatus, FleetStatus};

/// Load configuration from files and environment variables
pub fn load_configuration(path: Option<&Path>) -> Result<ServiceConfig> {
    config::load_config(path).context("Failed to load service configuration")
}
