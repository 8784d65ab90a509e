//! Sync Orchestrator
//!
//! One pass reads every active account and commits what it learns. Accounts are
//! grouped by server: a server's accounts are synced one after another by a single
//! worker, and the workers for different servers run concurrently. For each
//! account, new deals and the cursor are committed before the live fields, and a
//! failed read never touches the account's previous live state.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use ledger::{AccountNumber, LedgerError, LedgerStore, LiveUpdate, ManagedAccount, SyncCursor};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{FailureKind, Result};
use crate::escalation::{Escalation, EscalationSink};
use crate::fetcher::SnapshotFetcher;

/// What happened to one account during a pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AccountOutcome {
    Synced { new_deals: usize },
    /// The snapshot was older than the stored state and was discarded
    Stale,
    Failed { kind: FailureKind, reason: String },
    /// Another sync of the same account was already running
    SkippedInFlight,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSyncResult {
    pub account_number: AccountNumber,
    pub server: String,
    #[serde(flatten)]
    pub outcome: AccountOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub accounts: Vec<AccountSyncResult>,
}

impl SyncReport {
    pub fn synced(&self) -> usize {
        self.count(|o| matches!(o, AccountOutcome::Synced { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, AccountOutcome::Failed { .. }))
    }

    pub fn stale(&self) -> usize {
        self.count(|o| matches!(o, AccountOutcome::Stale))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, AccountOutcome::SkippedInFlight))
    }

    pub fn new_deals(&self) -> usize {
        self.accounts
            .iter()
            .map(|r| match r.outcome {
                AccountOutcome::Synced { new_deals } => new_deals,
                _ => 0,
            })
            .sum()
    }

    pub fn outcome(&self, account_number: AccountNumber) -> Option<&AccountOutcome> {
        self.accounts.iter().find(|r| r.account_number == account_number).map(|r| &r.outcome)
    }

    fn count(&self, pred: impl Fn(&AccountOutcome) -> bool) -> usize {
        self.accounts.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Marks an account as being synced until dropped
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<AccountNumber, DateTime<Utc>>,
    account_number: AccountNumber,
}

impl<'a> InFlightGuard<'a> {
    fn claim(in_flight: &'a DashMap<AccountNumber, DateTime<Utc>>, account_number: AccountNumber) -> Option<Self> {
        match in_flight.entry(account_number) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Some(Self { in_flight, account_number })
            }
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.account_number);
    }
}

pub struct SyncOrchestrator {
    store: Arc<dyn LedgerStore>,
    fetcher: Arc<SnapshotFetcher>,
    escalations: Arc<dyn EscalationSink>,
    config: SyncConfig,
    in_flight: DashMap<AccountNumber, DateTime<Utc>>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        fetcher: Arc<SnapshotFetcher>,
        escalations: Arc<dyn EscalationSink>,
        config: SyncConfig,
    ) -> Self {
        Self { store, fetcher, escalations, config, in_flight: DashMap::new() }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Accounts currently being synced
    pub fn in_flight(&self) -> Vec<AccountNumber> {
        let mut accounts: Vec<AccountNumber> = self.in_flight.iter().map(|e| *e.key()).collect();
        accounts.sort_unstable();
        accounts
    }

    /// Sync every active account once
    pub async fn run_pass(&self) -> Result<SyncReport> {
        let pass_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut by_server: BTreeMap<String, Vec<ManagedAccount>> = BTreeMap::new();
        for account in self.store.list_accounts(true).await? {
            by_server.entry(account.server.clone()).or_default().push(account);
        }

        info!(%pass_id, servers = by_server.len(), "Starting sync pass");

        let workers = by_server.into_iter().map(|(server, accounts)| async move {
            let mut results = Vec::with_capacity(accounts.len());
            for account in &accounts {
                let outcome = self.sync_account(account).await;
                results.push(AccountSyncResult {
                    account_number: account.account_number,
                    server: server.clone(),
                    outcome,
                });
            }
            results
        });
        let accounts: Vec<AccountSyncResult> = join_all(workers).await.into_iter().flatten().collect();

        let report = SyncReport { pass_id, started_at, finished_at: Utc::now(), accounts };
        info!(
            %pass_id,
            synced = report.synced(),
            failed = report.failed(),
            stale = report.stale(),
            skipped = report.skipped(),
            new_deals = report.new_deals(),
            "Sync pass completed"
        );
        Ok(report)
    }

    /// Sync one account, recording any failure against it
    pub async fn sync_account(&self, account: &ManagedAccount) -> AccountOutcome {
        let Some(_guard) = InFlightGuard::claim(&self.in_flight, account.account_number) else {
            debug!(account = account.account_number, "Sync already in flight, skipping");
            return AccountOutcome::SkippedInFlight;
        };

        let limit = self.config.account_timeout();
        match tokio::time::timeout(limit, self.fetch_and_commit(account)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => self.handle_failure(account, e.kind(), e.to_string()).await,
            Err(_) => {
                let reason = format!("account sync exceeded {limit:?}");
                self.handle_failure(account, FailureKind::Timeout, reason).await
            }
        }
    }

    async fn fetch_and_commit(&self, account: &ManagedAccount) -> Result<AccountOutcome> {
        let account_number = account.account_number;
        let cursor = self.store.cursor(account_number).await?;
        let snapshot = self.fetcher.fetch(account, cursor).await?;

        let stored = self
            .store
            .get_account(account_number)
            .await?
            .ok_or(LedgerError::AccountNotFound(account_number))?
            .last_sync_at;
        if let Some(stored) = stored {
            if snapshot.taken_at < stored {
                warn!(account = account_number, %stored, taken_at = %snapshot.taken_at, "Discarding stale snapshot");
                return Ok(AccountOutcome::Stale);
            }
        }

        let next_cursor = SyncCursor::advance(cursor, &snapshot.deals);
        let new_deals = self.store.append_deals(account_number, &snapshot.deals, next_cursor).await?;

        match self.store.update_live_fields(account_number, &snapshot.live_fields()).await? {
            LiveUpdate::Applied => {
                debug!(account = account_number, new_deals, equity = %snapshot.equity, "Account synced");
                Ok(AccountOutcome::Synced { new_deals })
            }
            LiveUpdate::Stale { stored } => {
                warn!(account = account_number, %stored, "Live fields superseded by a newer sync");
                Ok(AccountOutcome::Stale)
            }
        }
    }

    async fn handle_failure(&self, account: &ManagedAccount, kind: FailureKind, reason: String) -> AccountOutcome {
        let account_number = account.account_number;

        let consecutive_failures = match kind.connection_status() {
            Some(status) => match self.store.record_failure(account_number, status, &reason).await {
                Ok(count) => count,
                Err(e) => {
                    error!(account = account_number, "Failed to record sync failure: {}", e);
                    account.consecutive_failures + 1
                }
            },
            None => account.consecutive_failures,
        };

        warn!(
            account = account_number,
            server = %account.server,
            %kind,
            consecutive_failures,
            "Account sync failed: {}",
            reason
        );

        if kind.is_correctness() || (kind != FailureKind::Ledger && consecutive_failures >= self.config.escalation_threshold) {
            self.escalations
                .escalate(Escalation {
                    account_number,
                    server: account.server.clone(),
                    kind,
                    reason: reason.clone(),
                    consecutive_failures,
                    raised_at: Utc::now(),
                })
                .await;
        }

        AccountOutcome::Failed { kind, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetcherConfig;
    use crate::credentials::StaticCredentials;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use ledger::{ConnectionStatus, DealKind, InMemoryLedger, LiveFields};
    use rust_decimal::Decimal;
    use std::sync::Mutex;
    use std::time::Duration;
    use terminal_broker::fake::FakeTerminal;
    use terminal_broker::{BrokerConfig, DealRecord, RetryPolicy, TerminalBroker};

    const SERVER: &str = "MEXAtlantic-Real";

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<Escalation>>,
    }

    impl RecordingSink {
        fn received(&self) -> Vec<Escalation> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EscalationSink for RecordingSink {
        async fn escalate(&self, escalation: Escalation) {
            self.received.lock().unwrap().push(escalation);
        }
    }

    struct Harness {
        store: Arc<InMemoryLedger>,
        sink: Arc<RecordingSink>,
        orchestrator: SyncOrchestrator,
    }

    fn trade(ticket: i64, days_ago: i64) -> DealRecord {
        DealRecord {
            ticket,
            time: Utc::now() - ChronoDuration::days(days_ago),
            kind: DealKind::Trade,
            symbol: Some("EURUSD".into()),
            volume: Decimal::ONE,
            price: Decimal::new(108_500, 5),
            profit: Decimal::new(4_200, 2),
            swap: Decimal::ZERO,
            commission: Decimal::ZERO,
            comment: String::new(),
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy { max_attempts: 2, base_delay_ms: 10, multiplier: 2.0, max_delay_ms: 50 }
    }

    async fn harness(terminals: Vec<Arc<FakeTerminal>>, accounts: &[(AccountNumber, &str)], config: SyncConfig) -> Harness {
        let mut broker = TerminalBroker::new(&BrokerConfig { call_timeout_secs: 5, login_retry: quick_retry(), terminals: vec![] });
        for fake in terminals {
            broker.register(fake.server().to_string(), fake);
        }

        let store = Arc::new(InMemoryLedger::new());
        for &(account_number, server) in accounts {
            store
                .register_account(&ManagedAccount::new(account_number, "MEXAtlantic", server, "CORE"))
                .await
                .unwrap();
        }

        let fetcher = Arc::new(SnapshotFetcher::new(
            Arc::new(broker),
            Arc::new(StaticCredentials::shared("secret")),
            FetcherConfig { initial_lookback_days: 3650, read_retry: quick_retry() },
        ));
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = SyncOrchestrator::new(store.clone(), fetcher, sink.clone(), config);
        Harness { store, sink, orchestrator }
    }

    fn fake_with(server: &str, accounts: &[AccountNumber]) -> Arc<FakeTerminal> {
        let fake = FakeTerminal::new(server).with_latency(Duration::from_millis(2));
        for &account in accounts {
            fake.add_account(account, "secret", Decimal::new(10_000, 0));
        }
        Arc::new(fake)
    }

    #[tokio::test]
    async fn test_replayed_passes_are_idempotent() {
        let fake = fake_with(SERVER, &[885822]);
        fake.push_deal(885822, trade(1001, 3));
        fake.push_deal(885822, trade(1002, 2));
        fake.push_deal(885822, trade(1003, 1));
        let h = harness(vec![fake.clone()], &[(885822, SERVER)], SyncConfig::default()).await;

        let first = h.orchestrator.run_pass().await.unwrap();
        assert_eq!(first.outcome(885822), Some(&AccountOutcome::Synced { new_deals: 3 }));

        let second = h.orchestrator.run_pass().await.unwrap();
        assert_eq!(second.outcome(885822), Some(&AccountOutcome::Synced { new_deals: 0 }));
        assert_eq!(h.store.deals_for(885822).await.unwrap().len(), 3);

        // Replaying the exact same deals directly is also a no-op
        let deals = h.store.deals_for(885822).await.unwrap();
        assert_eq!(h.store.append_deals(885822, &deals, None).await.unwrap(), 0);

        fake.push_deal(885822, trade(1004, 0));
        let third = h.orchestrator.run_pass().await.unwrap();
        assert_eq!(third.outcome(885822), Some(&AccountOutcome::Synced { new_deals: 1 }));
        assert_eq!(h.store.cursor(885822).await.unwrap().unwrap().last_ticket, 1004);
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_discarded() {
        let fake = fake_with(SERVER, &[885822]);
        fake.push_deal(885822, trade(1001, 1));
        let h = harness(vec![fake], &[(885822, SERVER)], SyncConfig::default()).await;

        let newer = LiveFields {
            balance: Decimal::new(55_000, 0),
            equity: Decimal::new(55_500, 0),
            margin: Decimal::ZERO,
            profit: Decimal::ZERO,
            currency: Some("USD".into()),
            leverage: Some(100),
            as_of: Utc::now() + ChronoDuration::hours(1),
        };
        h.store.update_live_fields(885822, &newer).await.unwrap();

        let report = h.orchestrator.run_pass().await.unwrap();
        assert_eq!(report.outcome(885822), Some(&AccountOutcome::Stale));

        let account = h.store.get_account(885822).await.unwrap().unwrap();
        assert_eq!(account.equity, Decimal::new(55_500, 0));
        assert_eq!(account.last_sync_at, Some(newer.as_of));
        assert!(h.store.deals_for(885822).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_identity_mismatch_writes_nothing_and_escalates() {
        let fake = fake_with(SERVER, &[885822, 886557]);
        fake.push_deal(886557, trade(2001, 1));
        fake.impersonate(885822, 886557);
        let h = harness(vec![fake], &[(885822, SERVER)], SyncConfig::default()).await;
        let before = h.store.get_account(885822).await.unwrap().unwrap();
        let writes = h.store.write_count();

        let report = h.orchestrator.run_pass().await.unwrap();
        assert!(matches!(
            report.outcome(885822),
            Some(AccountOutcome::Failed { kind: FailureKind::AccountMismatch, .. })
        ));

        assert_eq!(h.store.write_count(), writes);
        assert_eq!(h.store.get_account(885822).await.unwrap().unwrap(), before);
        assert!(h.store.deals_for(885822).await.unwrap().is_empty());

        let escalations = h.sink.received();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].kind, FailureKind::AccountMismatch);
        assert_eq!(escalations[0].account_number, 885822);
    }

    #[tokio::test]
    async fn test_ticket_conflict_leaves_account_untouched() {
        let fake = fake_with(SERVER, &[885822, 885823]);
        fake.set_equity(885823, Decimal::new(77_000, 0));
        fake.push_deal(885822, trade(900, 2));
        // The terminal hands 885823 a ticket already owned by 885822 on the same server
        fake.push_deal(885823, trade(900, 1));
        let config = SyncConfig { escalation_threshold: 1, ..SyncConfig::default() };
        let h = harness(vec![fake], &[(885822, SERVER), (885823, SERVER)], config).await;

        let owner = h.store.get_account(885822).await.unwrap().unwrap();
        assert_eq!(h.orchestrator.sync_account(&owner).await, AccountOutcome::Synced { new_deals: 1 });

        let account = h.store.get_account(885823).await.unwrap().unwrap();
        for _ in 0..2 {
            let outcome = h.orchestrator.sync_account(&account).await;
            assert!(matches!(outcome, AccountOutcome::Failed { kind: FailureKind::Ledger, .. }));
        }

        assert_eq!(h.store.get_account(885823).await.unwrap().unwrap(), account);
        assert_eq!(account.last_sync_at, None);
        assert_eq!(account.equity, Decimal::ZERO);
        assert!(h.store.deals_for(885823).await.unwrap().is_empty());
        assert_eq!(h.store.cursor(885823).await.unwrap(), None);
        assert!(h.sink.received().is_empty());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_other_accounts() {
        let fake = fake_with(SERVER, &[885822]);
        // 886557 is unknown to the terminal, so its login is rejected
        let h = harness(vec![fake], &[(885822, SERVER), (886557, SERVER)], SyncConfig::default()).await;

        h.orchestrator.run_pass().await.unwrap();
        let good_before = h.store.get_account(885822).await.unwrap().unwrap();

        let report = h.orchestrator.run_pass().await.unwrap();
        assert!(matches!(report.outcome(885822), Some(AccountOutcome::Synced { .. })));
        assert!(matches!(
            report.outcome(886557),
            Some(AccountOutcome::Failed { kind: FailureKind::AuthFailed, .. })
        ));

        let bad = h.store.get_account(886557).await.unwrap().unwrap();
        assert_eq!(bad.connection_status, ConnectionStatus::AuthFailed);
        assert_eq!(bad.consecutive_failures, 2);
        assert_eq!(bad.balance, Decimal::ZERO);
        assert!(bad.status_reason.is_some());

        let good = h.store.get_account(885822).await.unwrap().unwrap();
        assert_eq!(good.connection_status, ConnectionStatus::Connected);
        assert!(good.last_sync_at >= good_before.last_sync_at);
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_live_state() {
        let fake = fake_with(SERVER, &[885822]);
        fake.set_equity(885822, Decimal::new(12_345, 0));
        let h = harness(vec![fake.clone()], &[(885822, SERVER)], SyncConfig::default()).await;

        h.orchestrator.run_pass().await.unwrap();
        fake.set_unreachable(true);
        let report = h.orchestrator.run_pass().await.unwrap();
        assert!(matches!(
            report.outcome(885822),
            Some(AccountOutcome::Failed { kind: FailureKind::Unreachable, .. })
        ));

        let account = h.store.get_account(885822).await.unwrap().unwrap();
        assert_eq!(account.equity, Decimal::new(12_345, 0));
        assert_eq!(account.connection_status, ConnectionStatus::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_repeated_failures_escalate_at_threshold() {
        let fake = fake_with(SERVER, &[]);
        let config = SyncConfig { escalation_threshold: 2, ..SyncConfig::default() };
        let h = harness(vec![fake], &[(886557, SERVER)], config).await;

        h.orchestrator.run_pass().await.unwrap();
        assert!(h.sink.received().is_empty());

        h.orchestrator.run_pass().await.unwrap();
        let escalations = h.sink.received();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].consecutive_failures, 2);
        assert_eq!(escalations[0].kind, FailureKind::AuthFailed);
    }

    #[tokio::test]
    async fn test_concurrent_sync_of_one_account_is_skipped() {
        let fake = fake_with(SERVER, &[885822]);
        let h = harness(vec![fake], &[(885822, SERVER)], SyncConfig::default()).await;
        let account = h.store.get_account(885822).await.unwrap().unwrap();

        let (first, second) = tokio::join!(
            h.orchestrator.sync_account(&account),
            h.orchestrator.sync_account(&account)
        );
        assert!(matches!(first, AccountOutcome::Synced { .. }));
        assert_eq!(second, AccountOutcome::SkippedInFlight);
        assert!(h.orchestrator.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_timeout_releases_terminal_and_records_timeout() {
        let fake = fake_with(SERVER, &[885822, 886557]);
        fake.hang_on(885822);
        let config = SyncConfig { account_timeout_secs: 1, ..SyncConfig::default() };
        let h = harness(vec![fake.clone()], &[(885822, SERVER), (886557, SERVER)], config).await;

        let report = h.orchestrator.run_pass().await.unwrap();
        assert!(matches!(
            report.outcome(885822),
            Some(AccountOutcome::Failed { kind: FailureKind::Timeout, .. })
        ));
        assert!(matches!(report.outcome(886557), Some(AccountOutcome::Synced { .. })));

        let account = h.store.get_account(885822).await.unwrap().unwrap();
        assert_eq!(account.connection_status, ConnectionStatus::Timeout);
        assert_eq!(fake.overlap_count(), 0);
    }

    #[tokio::test]
    async fn test_servers_sync_independently() {
        let atlantic = fake_with("MEXAtlantic-Real", &[885822, 885823]);
        let pacific = fake_with("Pacific-Live", &[700001, 700002]);
        let h = harness(
            vec![atlantic.clone(), pacific.clone()],
            &[(885822, "MEXAtlantic-Real"), (885823, "MEXAtlantic-Real"), (700001, "Pacific-Live"), (700002, "Pacific-Live")],
            SyncConfig::default(),
        )
        .await;

        let report = h.orchestrator.run_pass().await.unwrap();
        assert_eq!(report.synced(), 4);
        assert_eq!(atlantic.max_concurrency(), 1);
        assert_eq!(pacific.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_deactivated_accounts_are_not_synced() {
        let fake = fake_with(SERVER, &[885822, 885823]);
        let h = harness(vec![fake.clone()], &[(885822, SERVER), (885823, SERVER)], SyncConfig::default()).await;
        h.store.deactivate_account(885823).await.unwrap();

        let report = h.orchestrator.run_pass().await.unwrap();
        assert_eq!(report.accounts.len(), 1);
        assert_eq!(report.outcome(885823), None);
    }
}
