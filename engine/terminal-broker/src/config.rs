//! Broker configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Where the bridge of one physical terminal listens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEndpoint {
    /// Trading server this terminal is attached to
    pub server: String,
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Upper bound for any single bridge call
    pub call_timeout_secs: u64,
    pub login_retry: RetryPolicy,
    pub terminals: Vec<TerminalEndpoint>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { call_timeout_secs: 30, login_retry: RetryPolicy::default(), terminals: Vec::new() }
    }
}

impl BrokerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}
