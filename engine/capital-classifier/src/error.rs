//! Error types for the classifier

use ledger::{AccountNumber, LedgerError};
use thiserror::Error;

use crate::rules::RuleId;

/// Result type for classifier operations
pub type Result<T> = std::result::Result<T, ClassifierError>;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Account {account} matches mutually exclusive rules {first} and {second}")]
    ClassificationAmbiguous { account: AccountNumber, first: RuleId, second: RuleId },
}
