//! Error types for account synchronization

use ledger::{AccountNumber, ConnectionStatus, LedgerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use terminal_broker::TerminalError;
use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Why reading an account snapshot failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error(transparent)]
    Terminal(#[from] TerminalError),

    #[error("No credentials for account {account}: {reason}")]
    MissingCredentials { account: AccountNumber, reason: String },
}

/// Coarse classification of a failed account sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unreachable,
    AuthFailed,
    Timeout,
    AccountMismatch,
    /// The ledger rejected or failed the write
    Ledger,
}

impl FailureKind {
    /// Status recorded on the account; `None` when nothing may be written
    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        match self {
            FailureKind::Unreachable => Some(ConnectionStatus::ConnectionFailed),
            FailureKind::AuthFailed => Some(ConnectionStatus::AuthFailed),
            FailureKind::Timeout => Some(ConnectionStatus::Timeout),
            FailureKind::AccountMismatch | FailureKind::Ledger => None,
        }
    }

    /// Failures that signal a correctness problem rather than an outage
    pub fn is_correctness(&self) -> bool {
        matches!(self, FailureKind::AccountMismatch)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Unreachable => "unreachable",
            FailureKind::AuthFailed => "auth_failed",
            FailureKind::Timeout => "timeout",
            FailureKind::AccountMismatch => "account_mismatch",
            FailureKind::Ledger => "ledger",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Terminal(TerminalError::AuthFailed { .. }) => FailureKind::AuthFailed,
            FetchError::Terminal(TerminalError::Timeout { .. }) => FailureKind::Timeout,
            FetchError::Terminal(TerminalError::AccountMismatch { .. }) => FailureKind::AccountMismatch,
            FetchError::Terminal(
                TerminalError::Unreachable(_) | TerminalError::UnknownServer(_) | TerminalError::Protocol(_),
            ) => FailureKind::Unreachable,
            FetchError::MissingCredentials { .. } => FailureKind::AuthFailed,
        }
    }
}

/// Errors surfaced by the orchestrator
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl SyncError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::Fetch(e) => e.kind(),
            SyncError::Ledger(_) => FailureKind::Ledger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_failure_kinds_map_to_statuses() {
        let mismatch = FetchError::from(TerminalError::AccountMismatch { requested: 885822, reported: 886557 });
        assert_eq!(mismatch.kind(), FailureKind::AccountMismatch);
        assert_eq!(mismatch.kind().connection_status(), None);

        let timeout = FetchError::from(TerminalError::Timeout { operation: "login", after: Duration::from_secs(30) });
        assert_eq!(timeout.kind().connection_status(), Some(ConnectionStatus::Timeout));

        let unknown = FetchError::from(TerminalError::UnknownServer("Other-Live".into()));
        assert_eq!(unknown.kind().connection_status(), Some(ConnectionStatus::ConnectionFailed));

        let missing = FetchError::MissingCredentials { account: 1, reason: "unset".into() };
        assert_eq!(missing.kind(), FailureKind::AuthFailed);
    }
}
