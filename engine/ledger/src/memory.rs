//! In-memory ledger used for tests and dry runs

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::error::{LedgerError, Result};
use crate::store::LedgerStore;
use crate::types::{
    AccountNumber, CapitalSource, ConnectionStatus, Deal, LedgerSnapshot, LiveFields, LiveUpdate,
    ManagedAccount, SyncCursor, Ticket,
};

#[derive(Default)]
struct LedgerState {
    accounts: BTreeMap<AccountNumber, ManagedAccount>,
    deals: BTreeMap<AccountNumber, BTreeMap<Ticket, Deal>>,
    cursors: HashMap<AccountNumber, SyncCursor>,
    // (server, ticket) -> owning account
    server_tickets: HashMap<(String, Ticket), AccountNumber>,
}

/// Ledger held entirely in memory behind one lock, so every snapshot is consistent
#[derive(Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
    writes: AtomicU64,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls that changed stored state
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn register_account(&self, account: &ManagedAccount) -> Result<()> {
        let mut state = self.state.write().await;
        match state.accounts.get_mut(&account.account_number) {
            Some(existing) => {
                existing.broker = account.broker.clone();
                existing.server = account.server.clone();
                existing.fund_code = account.fund_code.clone();
                existing.owner = account.owner.clone();
                existing.manual_client_allocation = account.manual_client_allocation;
                existing.is_active = account.is_active;
            }
            None => {
                state.accounts.insert(account.account_number, account.clone());
            }
        }
        self.record_write();
        Ok(())
    }

    async fn deactivate_account(&self, account_number: AccountNumber) -> Result<()> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(&account_number)
            .ok_or(LedgerError::AccountNotFound(account_number))?;
        account.is_active = false;
        self.record_write();
        Ok(())
    }

    async fn get_account(&self, account_number: AccountNumber) -> Result<Option<ManagedAccount>> {
        Ok(self.state.read().await.accounts.get(&account_number).cloned())
    }

    async fn list_accounts(&self, active_only: bool) -> Result<Vec<ManagedAccount>> {
        let state = self.state.read().await;
        Ok(state.accounts.values().filter(|a| !active_only || a.is_active).cloned().collect())
    }

    async fn deals_for(&self, account_number: AccountNumber) -> Result<Vec<Deal>> {
        let state = self.state.read().await;
        Ok(state
            .deals
            .get(&account_number)
            .map(|deals| deals.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn cursor(&self, account_number: AccountNumber) -> Result<Option<SyncCursor>> {
        Ok(self.state.read().await.cursors.get(&account_number).copied())
    }

    async fn append_deals(
        &self,
        account_number: AccountNumber,
        deals: &[Deal],
        cursor: Option<SyncCursor>,
    ) -> Result<usize> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let server = state
            .accounts
            .get(&account_number)
            .map(|a| a.server.clone())
            .ok_or(LedgerError::AccountNotFound(account_number))?;

        // Validate the whole batch before touching anything so the write stays atomic
        for deal in deals {
            if deal.account_number != account_number {
                return Err(LedgerError::ForeignDeal {
                    expected: account_number,
                    found: deal.account_number,
                    ticket: deal.ticket,
                });
            }
            if let Some(&owner) = state.server_tickets.get(&(server.clone(), deal.ticket)) {
                if owner != account_number {
                    return Err(LedgerError::TicketConflict {
                        server: server.clone(),
                        ticket: deal.ticket,
                        owner,
                        attempted: account_number,
                    });
                }
            }
        }

        let mut inserted = 0;
        for deal in deals {
            let account_deals = state.deals.entry(account_number).or_default();
            if account_deals.contains_key(&deal.ticket) {
                continue;
            }
            account_deals.insert(deal.ticket, deal.clone());
            state.server_tickets.insert((server.clone(), deal.ticket), account_number);
            inserted += 1;
        }

        let mut cursor_moved = false;
        if let Some(new_cursor) = cursor {
            let merged = match state.cursors.get(&account_number) {
                Some(existing) => existing.merge(new_cursor),
                None => new_cursor,
            };
            cursor_moved = state.cursors.insert(account_number, merged) != Some(merged);
        }

        if inserted > 0 || cursor_moved {
            self.record_write();
        }
        Ok(inserted)
    }

    async fn update_live_fields(
        &self,
        account_number: AccountNumber,
        fields: &LiveFields,
    ) -> Result<LiveUpdate> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(&account_number)
            .ok_or(LedgerError::AccountNotFound(account_number))?;

        if let Some(stored) = account.last_sync_at {
            if fields.as_of < stored {
                return Ok(LiveUpdate::Stale { stored });
            }
        }

        account.balance = fields.balance;
        account.equity = fields.equity;
        account.margin = fields.margin;
        account.profit = fields.profit;
        account.currency = fields.currency.clone();
        account.leverage = fields.leverage;
        account.last_sync_at = Some(fields.as_of);
        account.connection_status = ConnectionStatus::Connected;
        account.status_reason = None;
        account.consecutive_failures = 0;
        self.record_write();
        Ok(LiveUpdate::Applied)
    }

    async fn record_failure(
        &self,
        account_number: AccountNumber,
        status: ConnectionStatus,
        reason: &str,
    ) -> Result<u32> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(&account_number)
            .ok_or(LedgerError::AccountNotFound(account_number))?;
        account.connection_status = status;
        account.status_reason = Some(reason.to_string());
        account.consecutive_failures += 1;
        self.record_write();
        Ok(account.consecutive_failures)
    }

    async fn set_classification(
        &self,
        account_number: AccountNumber,
        capital_source: CapitalSource,
        initial_allocation: Decimal,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(&account_number)
            .ok_or(LedgerError::AccountNotFound(account_number))?;
        if account.capital_source == capital_source && account.initial_allocation == initial_allocation {
            return Ok(false);
        }
        account.capital_source = capital_source;
        account.initial_allocation = initial_allocation;
        self.record_write();
        Ok(true)
    }

    async fn snapshot(&self) -> Result<LedgerSnapshot> {
        let state = self.state.read().await;
        Ok(LedgerSnapshot {
            taken_at: Utc::now(),
            accounts: state.accounts.values().cloned().collect(),
            deals: state
                .deals
                .iter()
                .map(|(account, deals)| (*account, deals.values().cloned().collect()))
                .collect(),
            cursors: state.cursors.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 9, minute, 0).unwrap()
    }

    fn live(equity: i64, as_of: DateTime<Utc>) -> LiveFields {
        LiveFields {
            balance: Decimal::from(equity),
            equity: Decimal::from(equity),
            margin: Decimal::ZERO,
            profit: Decimal::ZERO,
            currency: Some("USD".to_string()),
            leverage: Some(100),
            as_of,
        }
    }

    async fn ledger_with(accounts: &[(AccountNumber, &str)]) -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        for (number, server) in accounts {
            ledger
                .register_account(&ManagedAccount::new(*number, "MEXAtlantic", *server, "CORE"))
                .await
                .unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn test_append_deals_is_idempotent() {
        let ledger = ledger_with(&[(885822, "MEX-Real")]).await;
        let deals = vec![
            Deal::balance(1001, 885822, at(0), Decimal::from(1000), "Deposit"),
            Deal::balance(1002, 885822, at(1), Decimal::from(-50), "Withdrawal"),
        ];
        let cursor = SyncCursor::advance(None, &deals);

        assert_eq!(ledger.append_deals(885822, &deals, cursor).await.unwrap(), 2);
        let writes = ledger.write_count();
        assert_eq!(ledger.append_deals(885822, &deals, cursor).await.unwrap(), 0);
        assert_eq!(ledger.write_count(), writes);
        assert_eq!(ledger.deals_for(885822).await.unwrap().len(), 2);
        assert_eq!(ledger.cursor(885822).await.unwrap().unwrap().last_ticket, 1002);
    }

    #[tokio::test]
    async fn test_ticket_reuse_across_accounts_on_one_server_is_rejected() {
        let ledger = ledger_with(&[(885822, "MEX-Real"), (886557, "MEX-Real"), (700001, "LUCHS-Live")]).await;
        let deal = Deal::balance(1001, 885822, at(0), Decimal::from(1000), "Deposit");
        ledger.append_deals(885822, &[deal.clone()], None).await.unwrap();

        let mut reused = deal.clone();
        reused.account_number = 886557;
        let err = ledger.append_deals(886557, &[reused], None).await.unwrap_err();
        assert!(matches!(err, LedgerError::TicketConflict { owner: 885822, .. }));

        // Same ticket on a different server is a different ledger entry
        let mut other_server = deal;
        other_server.account_number = 700001;
        assert_eq!(ledger.append_deals(700001, &[other_server], None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_foreign_deal_rejects_whole_batch() {
        let ledger = ledger_with(&[(885822, "MEX-Real")]).await;
        let deals = vec![
            Deal::balance(1, 885822, at(0), Decimal::ONE, "ok"),
            Deal::balance(2, 886557, at(0), Decimal::ONE, "foreign"),
        ];
        assert!(matches!(
            ledger.append_deals(885822, &deals, None).await,
            Err(LedgerError::ForeignDeal { found: 886557, .. })
        ));
        assert!(ledger.deals_for(885822).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_live_update_is_discarded() {
        let ledger = ledger_with(&[(885822, "MEX-Real")]).await;
        assert_eq!(ledger.update_live_fields(885822, &live(1000, at(10))).await.unwrap(), LiveUpdate::Applied);

        let outcome = ledger.update_live_fields(885822, &live(5, at(10) - Duration::minutes(1))).await.unwrap();
        assert_eq!(outcome, LiveUpdate::Stale { stored: at(10) });

        let account = ledger.get_account(885822).await.unwrap().unwrap();
        assert_eq!(account.equity, Decimal::from(1000));
    }

    #[tokio::test]
    async fn test_failure_keeps_live_fields_and_success_clears_streak() {
        let ledger = ledger_with(&[(885822, "MEX-Real")]).await;
        ledger.update_live_fields(885822, &live(1000, at(1))).await.unwrap();

        assert_eq!(ledger.record_failure(885822, ConnectionStatus::Timeout, "bridge timeout").await.unwrap(), 1);
        assert_eq!(
            ledger.record_failure(885822, ConnectionStatus::ConnectionFailed, "refused").await.unwrap(),
            2
        );
        let account = ledger.get_account(885822).await.unwrap().unwrap();
        assert_eq!(account.equity, Decimal::from(1000));
        assert_eq!(account.connection_status, ConnectionStatus::ConnectionFailed);

        ledger.update_live_fields(885822, &live(1010, at(2))).await.unwrap();
        let account = ledger.get_account(885822).await.unwrap().unwrap();
        assert_eq!(account.consecutive_failures, 0);
        assert_eq!(account.status_reason, None);
    }

    #[tokio::test]
    async fn test_register_account_preserves_live_and_classification_fields() {
        let ledger = ledger_with(&[(885822, "MEX-Real")]).await;
        ledger.update_live_fields(885822, &live(1000, at(1))).await.unwrap();
        ledger.set_classification(885822, CapitalSource::Client, Decimal::from(900)).await.unwrap();

        let roster_entry = ManagedAccount::new(885822, "MEXAtlantic", "MEX-Real-2", "BALANCE").with_owner("Alejandro");
        ledger.register_account(&roster_entry).await.unwrap();

        let account = ledger.get_account(885822).await.unwrap().unwrap();
        assert_eq!(account.server, "MEX-Real-2");
        assert_eq!(account.fund_code, "BALANCE");
        assert_eq!(account.equity, Decimal::from(1000));
        assert_eq!(account.capital_source, CapitalSource::Client);
        assert_eq!(account.initial_allocation, Decimal::from(900));
    }

    #[tokio::test]
    async fn test_set_classification_reports_changes_only() {
        let ledger = ledger_with(&[(885822, "MEX-Real")]).await;
        assert!(ledger.set_classification(885822, CapitalSource::Fidus, Decimal::from(10)).await.unwrap());
        assert!(!ledger.set_classification(885822, CapitalSource::Fidus, Decimal::from(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_deactivated_accounts_remain_listed() {
        let ledger = ledger_with(&[(885822, "MEX-Real"), (886557, "MEX-Real")]).await;
        ledger.deactivate_account(886557).await.unwrap();

        assert_eq!(ledger.list_accounts(true).await.unwrap().len(), 1);
        assert_eq!(ledger.list_accounts(false).await.unwrap().len(), 2);
        assert!(matches!(ledger.deactivate_account(1).await, Err(LedgerError::AccountNotFound(1))));
    }
}
