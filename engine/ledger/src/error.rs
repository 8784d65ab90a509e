//! Error types for the ledger

use crate::types::{AccountNumber, Ticket};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur while reading or writing the ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountNumber),

    #[error("Deal {ticket} belongs to account {found}, not {expected}")]
    ForeignDeal { expected: AccountNumber, found: AccountNumber, ticket: Ticket },

    #[error("Ticket {ticket} on server {server} is already recorded for account {owner}, refusing it for {attempted}")]
    TicketConflict { server: String, ticket: Ticket, owner: AccountNumber, attempted: AccountNumber },

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl LedgerError {
    /// Create a new invalid data error
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }
}
