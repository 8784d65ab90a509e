//! Ledger - managed accounts, deal history and sync cursors
//!
//! This crate owns the persistent record of the managed-account fleet. Accounts are
//! created from a static roster and never deleted; deals are append-only and keyed by
//! `(account_number, ticket)`. Every aggregate the rest of the system reports is derived
//! from a [`LedgerSnapshot`] taken through the [`LedgerStore`] port.

pub mod config;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod types;

pub use config::DatabaseConfig;
pub use error::{LedgerError, Result};
pub use memory::InMemoryLedger;
pub use postgres::PgLedger;
pub use store::LedgerStore;
pub use types::{
    AccountNumber, CapitalAllocation, CapitalSource, ConnectionStatus, Deal, DealKind,
    LedgerSnapshot, LiveFields, LiveUpdate, ManagedAccount, SyncCursor, Ticket,
};
