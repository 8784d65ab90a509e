//! Ledger data model

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;

/// Trading account login number, unique across the fleet
pub type AccountNumber = i64;

/// Deal ticket as issued by the trading server
pub type Ticket = i64;

/// Ownership tier of the funds held in an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapitalSource {
    Client,
    Fidus,
    ReinvestedProfit,
    Separation,
    Intermediary,
    Unknown,
}

impl CapitalSource {
    pub const ALL: [CapitalSource; 6] = [
        CapitalSource::Client,
        CapitalSource::Fidus,
        CapitalSource::ReinvestedProfit,
        CapitalSource::Separation,
        CapitalSource::Intermediary,
        CapitalSource::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapitalSource::Client => "client",
            CapitalSource::Fidus => "fidus",
            CapitalSource::ReinvestedProfit => "reinvested_profit",
            CapitalSource::Separation => "separation",
            CapitalSource::Intermediary => "intermediary",
            CapitalSource::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CapitalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapitalSource {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CapitalSource::ALL
            .into_iter()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| LedgerError::invalid_data(format!("unknown capital source '{s}'")))
    }
}

/// Connection state of an account as last observed by the sync orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Registered but never synced
    Pending,
    Connected,
    ConnectionFailed,
    AuthFailed,
    Timeout,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::ConnectionFailed => "connection_failed",
            ConnectionStatus::AuthFailed => "auth_failed",
            ConnectionStatus::Timeout => "timeout",
        }
    }

    /// Whether this status means the last sync attempt failed
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::ConnectionFailed | ConnectionStatus::AuthFailed | ConnectionStatus::Timeout
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConnectionStatus::Pending),
            "connected" => Ok(ConnectionStatus::Connected),
            "connection_failed" => Ok(ConnectionStatus::ConnectionFailed),
            "auth_failed" => Ok(ConnectionStatus::AuthFailed),
            "timeout" => Ok(ConnectionStatus::Timeout),
            other => Err(LedgerError::invalid_data(format!("unknown connection status '{other}'"))),
        }
    }
}

/// A managed trading account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedAccount {
    pub account_number: AccountNumber,
    pub broker: String,
    /// Trading server; one physical terminal serves each server
    pub server: String,
    pub fund_code: String,
    pub owner: Option<String>,

    // Classification (written by the capital classifier only)
    pub capital_source: CapitalSource,
    pub initial_allocation: Decimal,
    /// Explicit client assignment from the roster, if any
    pub manual_client_allocation: Option<Decimal>,

    // Live fields (written by the sync orchestrator only)
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub profit: Decimal,
    pub currency: Option<String>,
    pub leverage: Option<i32>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub connection_status: ConnectionStatus,
    pub status_reason: Option<String>,
    pub consecutive_failures: u32,

    pub is_active: bool,
}

impl ManagedAccount {
    /// Create a freshly registered, never-synced account
    pub fn new(
        account_number: AccountNumber,
        broker: impl Into<String>,
        server: impl Into<String>,
        fund_code: impl Into<String>,
    ) -> Self {
        Self {
            account_number,
            broker: broker.into(),
            server: server.into(),
            fund_code: fund_code.into(),
            owner: None,
            capital_source: CapitalSource::Unknown,
            initial_allocation: Decimal::ZERO,
            manual_client_allocation: None,
            balance: Decimal::ZERO,
            equity: Decimal::ZERO,
            margin: Decimal::ZERO,
            profit: Decimal::ZERO,
            currency: None,
            leverage: None,
            last_sync_at: None,
            connection_status: ConnectionStatus::Pending,
            status_reason: None,
            consecutive_failures: 0,
            is_active: true,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_manual_client_allocation(mut self, allocation: Decimal) -> Self {
        self.manual_client_allocation = Some(allocation);
        self
    }

    /// Whether the account was synced successfully within `max_age` of `now`
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match self.last_sync_at {
            Some(at) => self.connection_status == ConnectionStatus::Connected && now - at <= max_age,
            None => false,
        }
    }
}

/// Ledger entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealKind {
    Trade,
    /// Deposit, withdrawal or internal transfer
    Balance,
}

impl DealKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealKind::Trade => "trade",
            DealKind::Balance => "balance",
        }
    }
}

impl FromStr for DealKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade" => Ok(DealKind::Trade),
            "balance" => Ok(DealKind::Balance),
            other => Err(LedgerError::invalid_data(format!("unknown deal kind '{other}'"))),
        }
    }
}

/// A single immutable ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub ticket: Ticket,
    pub account_number: AccountNumber,
    pub time: DateTime<Utc>,
    pub kind: DealKind,
    pub symbol: Option<String>,
    pub volume: Decimal,
    pub price: Decimal,
    /// Trade result, or the signed amount of a balance operation
    pub profit: Decimal,
    pub swap: Decimal,
    pub commission: Decimal,
    pub comment: String,
}

impl Deal {
    /// Build a balance operation (deposit when `amount` is positive)
    pub fn balance(
        ticket: Ticket,
        account_number: AccountNumber,
        time: DateTime<Utc>,
        amount: Decimal,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            ticket,
            account_number,
            time,
            kind: DealKind::Balance,
            symbol: None,
            volume: Decimal::ZERO,
            price: Decimal::ZERO,
            profit: amount,
            swap: Decimal::ZERO,
            commission: Decimal::ZERO,
            comment: comment.into(),
        }
    }

    pub fn is_balance(&self) -> bool {
        self.kind == DealKind::Balance
    }

    /// Cash effect of the deal on the account balance
    pub fn net_amount(&self) -> Decimal {
        self.profit + self.swap + self.commission
    }
}

/// Per-account position in the deal history already recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub last_ticket: Ticket,
    pub last_deal_time: DateTime<Utc>,
}

impl SyncCursor {
    /// Advance `previous` past every deal in `deals`; never moves backwards
    pub fn advance(previous: Option<SyncCursor>, deals: &[Deal]) -> Option<SyncCursor> {
        deals.iter().fold(previous, |cursor, deal| {
            Some(match cursor {
                Some(c) => SyncCursor {
                    last_ticket: c.last_ticket.max(deal.ticket),
                    last_deal_time: c.last_deal_time.max(deal.time),
                },
                None => SyncCursor { last_ticket: deal.ticket, last_deal_time: deal.time },
            })
        })
    }

    /// Merge two cursors taking the furthest position of each
    pub fn merge(self, other: SyncCursor) -> SyncCursor {
        SyncCursor {
            last_ticket: self.last_ticket.max(other.last_ticket),
            last_deal_time: self.last_deal_time.max(other.last_deal_time),
        }
    }
}

/// Live account state read from the terminal at `as_of`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveFields {
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub profit: Decimal,
    pub currency: Option<String>,
    pub leverage: Option<i32>,
    pub as_of: DateTime<Utc>,
}

/// Result of a conditional live-field update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveUpdate {
    Applied,
    /// The stored state is newer than the update; nothing was written
    Stale { stored: DateTime<Utc> },
}

/// Derived view of an account's capital classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalAllocation {
    pub account_number: AccountNumber,
    pub capital_source: CapitalSource,
    pub initial_allocation: Decimal,
    pub profit_withdrawals_total: Decimal,
}

/// Point-in-time read of the whole ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub taken_at: DateTime<Utc>,
    pub accounts: Vec<ManagedAccount>,
    pub deals: HashMap<AccountNumber, Vec<Deal>>,
    pub cursors: HashMap<AccountNumber, SyncCursor>,
}

impl LedgerSnapshot {
    pub fn account(&self, account_number: AccountNumber) -> Option<&ManagedAccount> {
        self.accounts.iter().find(|a| a.account_number == account_number)
    }

    /// Deals of one account ordered by ticket
    pub fn deals_for(&self, account_number: AccountNumber) -> &[Deal] {
        self.deals.get(&account_number).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn active_accounts(&self) -> impl Iterator<Item = &ManagedAccount> {
        self.accounts.iter().filter(|a| a.is_active)
    }

    pub fn deal_count(&self) -> usize {
        self.deals.values().map(Vec::len).sum()
    }
}
