//! Error types for terminal access

use ledger::AccountNumber;
use std::time::Duration;
use thiserror::Error;

/// Result type for terminal operations
pub type Result<T> = std::result::Result<T, TerminalError>;

/// Errors raised while talking to a trading terminal
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TerminalError {
    #[error("Terminal unreachable: {0}")]
    Unreachable(String),

    #[error("Authentication failed for account {account}: {reason}")]
    AuthFailed { account: AccountNumber, reason: String },

    #[error("Terminal call '{operation}' timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },

    #[error("Terminal reports account {reported} while {requested} was requested")]
    AccountMismatch { requested: AccountNumber, reported: AccountNumber },

    #[error("No terminal configured for server '{0}'")]
    UnknownServer(String),

    #[error("Malformed terminal response: {0}")]
    Protocol(String),
}

impl TerminalError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, TerminalError::Unreachable(_) | TerminalError::Timeout { .. })
    }
}

/// Decides whether a failed attempt may be retried
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for TerminalError {
    fn is_retryable(&self) -> bool {
        TerminalError::is_retryable(self)
    }
}

impl From<reqwest::Error> for TerminalError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TerminalError::Timeout { operation: "http", after: Duration::ZERO }
        } else if err.is_decode() {
            TerminalError::Protocol(err.to_string())
        } else {
            TerminalError::Unreachable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TerminalError {
    fn from(err: serde_json::Error) -> Self {
        TerminalError::Protocol(err.to_string())
    }
}
