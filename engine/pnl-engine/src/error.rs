//! Error types for the P&L engine

use ledger::{AccountNumber, LedgerError};
use thiserror::Error;

/// Result type for P&L operations
pub type Result<T> = std::result::Result<T, PnlError>;

#[derive(Error, Debug)]
pub enum PnlError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountNumber),
}
