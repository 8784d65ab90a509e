//! Error types for the watchdog

use ledger::LedgerError;
use thiserror::Error;

/// Result type for watchdog operations
pub type Result<T> = std::result::Result<T, WatchdogError>;

#[derive(Error, Debug)]
pub enum WatchdogError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remediation hook '{hook}' rejected the request: {detail}")]
    HookRejected { hook: String, detail: String },
}
