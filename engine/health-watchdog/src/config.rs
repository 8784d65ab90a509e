//! Watchdog configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_interval_secs: u64,
    /// An account synced longer ago than this is stale
    pub max_sync_age_secs: u64,
    /// Minimum share of expected accounts that must be fresh and connected
    pub min_coverage: f64,
    /// Consecutive degraded checks before remediation is requested
    pub degraded_checks_before_healing: u32,
    pub healing_cooldown_secs: u64,
    pub backoff_multiplier: f64,
    pub max_cooldown_secs: u64,
    /// Remediation endpoint; remediation is only logged when unset
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            max_sync_age_secs: 900,
            min_coverage: 0.9,
            degraded_checks_before_healing: 3,
            healing_cooldown_secs: 1800,
            backoff_multiplier: 2.0,
            max_cooldown_secs: 4 * 3600,
            webhook_url: None,
            webhook_timeout_secs: 10,
        }
    }
}

impl WatchdogConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn max_sync_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_sync_age_secs as i64)
    }

    pub fn healing_cooldown(&self) -> Duration {
        Duration::from_secs(self.healing_cooldown_secs)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}
