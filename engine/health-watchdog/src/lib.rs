//! Health Watchdog
//!
//! Monitors sync freshness and coverage across the fleet and requests external
//! remediation, at most once per cooldown window.

pub mod config;
pub mod error;
pub mod remediation;
pub mod state;
pub mod watchdog;

pub use config::WatchdogConfig;
pub use error::{Result, WatchdogError};
pub use remediation::{LogOnlyHook, RemediationHook, RemediationRequest, WebhookHook};
pub use state::{HealingPolicy, HealthStateMachine, WatchdogState};
pub use watchdog::{assess, AccountHealth, Breach, HealingOutcome, HealthReport, HealthWatchdog};
