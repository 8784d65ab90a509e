//! Bridge protocol spoken by a single physical terminal

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger::{AccountNumber, DealKind, Ticket};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Login secret for one account
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    password: String,
}

impl Credentials {
    pub fn new(password: impl Into<String>) -> Self {
        Self { password: password.into() }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("password", &"***").finish()
    }
}

/// A response that names the account the terminal is authenticated as
pub trait Identified {
    fn login(&self) -> AccountNumber;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub connected: bool,
    #[serde(default)]
    pub login: Option<AccountNumber>,
    #[serde(default)]
    pub server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub login: AccountNumber,
    pub server: String,
}

/// Live account state as reported by the terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub login: AccountNumber,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub profit: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub leverage: Option<i32>,
}

/// One deal as reported by the terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    pub ticket: Ticket,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: DealKind,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub volume: Decimal,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub profit: Decimal,
    #[serde(default)]
    pub swap: Decimal,
    #[serde(default)]
    pub commission: Decimal,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealHistory {
    pub login: AccountNumber,
    pub deals: Vec<DealRecord>,
}

impl Identified for LoginResponse {
    fn login(&self) -> AccountNumber {
        self.login
    }
}

impl Identified for AccountInfo {
    fn login(&self) -> AccountNumber {
        self.login
    }
}

impl Identified for DealHistory {
    fn login(&self) -> AccountNumber {
        self.login
    }
}

/// Request/response contract of one physical terminal
///
/// A terminal holds exactly one authenticated account at a time; `login` replaces
/// whatever account was active before. Callers must hold the terminal's lease
/// from [`crate::TerminalBroker`] for the whole login-then-read sequence.
#[async_trait]
pub trait TerminalBridge: Send + Sync {
    async fn health(&self) -> Result<HealthStatus>;

    async fn login(
        &self,
        account: AccountNumber,
        credentials: &Credentials,
        server: &str,
    ) -> Result<LoginResponse>;

    /// State of the currently authenticated account
    async fn account_info(&self, account: AccountNumber) -> Result<AccountInfo>;

    /// Deals of the currently authenticated account with `from <= time <= to`
    async fn deal_history(
        &self,
        account: AccountNumber,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<DealHistory>;
}
