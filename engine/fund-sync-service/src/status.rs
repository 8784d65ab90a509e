//! Read-only fleet status

use chrono::{DateTime, Utc};
use ledger::{AccountNumber, CapitalSource, ConnectionStatus, LedgerSnapshot, Ticket};
use rust_decimal::Decimal;
use serde::Serialize;
use terminal_broker::TerminalHealth;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountStatus {
    pub account_number: AccountNumber,
    pub server: String,
    pub fund_code: String,
    pub owner: Option<String>,
    pub capital_source: CapitalSource,
    pub connection_status: ConnectionStatus,
    pub status_reason: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub balance: Decimal,
    pub equity: Decimal,
    pub deal_count: usize,
    pub last_ticket: Option<Ticket>,
    pub syncing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetStatus {
    pub taken_at: DateTime<Utc>,
    pub active_accounts: usize,
    pub connected: usize,
    pub degraded: usize,
    pub never_synced: usize,
    pub accounts: Vec<AccountStatus>,
    pub terminals: Vec<TerminalHealth>,
}

impl FleetStatus {
    pub fn from_snapshot(snapshot: &LedgerSnapshot, terminals: Vec<TerminalHealth>, in_flight: &[AccountNumber]) -> Self {
        let mut accounts: Vec<AccountStatus> = snapshot
            .active_accounts()
            .map(|a| AccountStatus {
                account_number: a.account_number,
                server: a.server.clone(),
                fund_code: a.fund_code.clone(),
                owner: a.owner.clone(),
                capital_source: a.capital_source,
                connection_status: a.connection_status,
                status_reason: a.status_reason.clone(),
                last_sync_at: a.last_sync_at,
                consecutive_failures: a.consecutive_failures,
                balance: a.balance,
                equity: a.equity,
                deal_count: snapshot.deals_for(a.account_number).len(),
                last_ticket: snapshot.cursors.get(&a.account_number).map(|c| c.last_ticket),
                syncing: in_flight.contains(&a.account_number),
            })
            .collect();
        accounts.sort_by_key(|a| a.account_number);

        Self {
            taken_at: snapshot.taken_at,
            active_accounts: accounts.len(),
            connected: accounts.iter().filter(|a| a.connection_status == ConnectionStatus::Connected).count(),
            degraded: accounts.iter().filter(|a| a.connection_status.is_degraded()).count(),
            never_synced: accounts.iter().filter(|a| a.last_sync_at.is_none()).count(),
            accounts,
            terminals,
        }
    }
}
