//! Tiered P&L Calculator
//!
//! Aggregates classified accounts into per-tier and per-fund profit/loss reports.
//! Reports are computed on demand and never persisted.

pub mod calculator;
pub mod error;
pub mod types;

pub use calculator::PnlCalculator;
pub use error::{PnlError, Result};
pub use types::{return_percent, AccountPnl, PnlSnapshot, PnlTotals, TierReport, TierSummary};
