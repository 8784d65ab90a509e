//! Terminal Session Broker
//!
//! Owns the fixed set of physical trading terminals (one per server), serializes
//! exclusive access to each, and verifies which account a terminal is authenticated
//! as before any data read through it is trusted.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod error;
pub mod http;
pub mod retry;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use bridge::{
    AccountInfo, Credentials, DealHistory, DealRecord, HealthStatus, Identified, LoginResponse,
    TerminalBridge,
};
pub use broker::{TerminalBroker, TerminalHealth, TerminalLease, TerminalSession};
pub use config::{BrokerConfig, TerminalEndpoint};
pub use error::{Result, Retryable, TerminalError};
pub use http::HttpBridge;
pub use retry::RetryPolicy;
