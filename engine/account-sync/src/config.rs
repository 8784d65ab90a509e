//! Sync configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use terminal_broker::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// History window for an account that has never been synced
    pub initial_lookback_days: i64,
    pub read_retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self { initial_lookback_days: 3650, read_retry: RetryPolicy::default() }
    }
}

impl FetcherConfig {
    /// Longest accepted first-sync history window
    pub const MAX_LOOKBACK_DAYS: i64 = 36_500;

    /// The first-sync window, kept within `1..=MAX_LOOKBACK_DAYS` days
    pub fn initial_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(self.initial_lookback_days.clamp(1, Self::MAX_LOOKBACK_DAYS))
    }

    pub fn lookback_in_range(&self) -> bool {
        (1..=Self::MAX_LOOKBACK_DAYS).contains(&self.initial_lookback_days)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    /// Upper bound for one account's fetch-and-commit
    pub account_timeout_secs: u64,
    /// Consecutive failures before an account is escalated
    pub escalation_threshold: u32,
    pub fetcher: FetcherConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            account_timeout_secs: 120,
            escalation_threshold: 3,
            fetcher: FetcherConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn account_timeout(&self) -> Duration {
        Duration::from_secs(self.account_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookback_out_of_range_is_clamped() {
        let config = |days| FetcherConfig { initial_lookback_days: days, ..FetcherConfig::default() };

        assert!(config(3650).lookback_in_range());
        assert!(!config(0).lookback_in_range());
        assert!(!config(-7).lookback_in_range());
        assert!(!config(i64::MAX).lookback_in_range());

        assert_eq!(config(-7).initial_lookback(), chrono::Duration::days(1));
        assert_eq!(
            config(i64::MAX).initial_lookback(),
            chrono::Duration::days(FetcherConfig::MAX_LOOKBACK_DAYS)
        );
    }
}
