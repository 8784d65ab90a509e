//! End-to-end wiring against a fake terminal and an in-memory ledger

use account_sync::{AccountOutcome, FailureKind, StaticCredentials};
use chrono::{Duration, Utc};
use fund_sync_service::{FundSyncService, Roster, ServiceConfig};
use health_watchdog::{Breach, WatchdogState};
use ledger::{CapitalSource, ConnectionStatus, InMemoryLedger, LedgerStore};
use rust_decimal::Decimal;
use std::sync::Arc;
use terminal_broker::fake::FakeTerminal;
use terminal_broker::{BrokerConfig, TerminalBroker};

const SERVER: &str = "MEXAtlantic-Real";

const ROSTER: &str = r#"
    [[accounts]]
    account_number = 885822
    broker = "MEXAtlantic"
    server = "MEXAtlantic-Real"
    fund_code = "CORE"
    owner = "Alejandro Mariscal"

    [[accounts]]
    account_number = 886528
    broker = "MEXAtlantic"
    server = "MEXAtlantic-Real"
    fund_code = "SEPARATION"

    [[accounts]]
    account_number = 886557
    broker = "MEXAtlantic"
    server = "MEXAtlantic-Real"
    fund_code = "BALANCE"
"#;

struct Fixture {
    service: FundSyncService,
    store: Arc<InMemoryLedger>,
}

fn fixture() -> Fixture {
    let month_ago = Utc::now() - Duration::days(30);
    let fake = Arc::new(FakeTerminal::new(SERVER));

    fake.add_account(885822, "secret", Decimal::new(98_000, 0));
    fake.set_equity(885822, Decimal::new(99_500, 0));
    fake.push_balance(885822, 5001, month_ago, Decimal::new(100_000, 0), "Client deposit wire");
    fake.push_balance(885822, 5002, month_ago + Duration::days(7), Decimal::new(-2_000, 0), "Transfer to #886528");

    fake.add_account(886528, "secret", Decimal::new(2_000, 0));
    fake.push_balance(886528, 5003, month_ago + Duration::days(7), Decimal::new(2_000, 0), "Transfer from #885822");

    // The terminal lands on the wrong account for this login
    fake.add_account(886557, "secret", Decimal::new(10_000, 0));
    fake.impersonate(886557, 885822);

    let mut config = ServiceConfig::default();
    config.classifier.separation_accounts.insert(886528);

    let broker = TerminalBroker::new(&BrokerConfig::default()).with_terminal(SERVER, fake);
    let store = Arc::new(InMemoryLedger::new());
    let service = FundSyncService::from_parts(
        config,
        Roster::parse(ROSTER).unwrap(),
        store.clone(),
        broker,
        Arc::new(StaticCredentials::shared("secret")),
    )
    .unwrap();

    Fixture { service, store }
}

#[tokio::test]
async fn test_sync_once_persists_and_classifies() {
    let Fixture { service, store } = fixture();
    service.seed().await.unwrap();

    let (report, classification) = service.sync_once().await.unwrap();
    assert_eq!(report.outcome(885822), Some(&AccountOutcome::Synced { new_deals: 2 }));
    assert_eq!(report.outcome(886528), Some(&AccountOutcome::Synced { new_deals: 1 }));
    assert!(matches!(
        report.outcome(886557),
        Some(AccountOutcome::Failed { kind: FailureKind::AccountMismatch, .. })
    ));

    // Nothing was written for the mismatched account
    let mismatched = store.get_account(886557).await.unwrap().unwrap();
    assert_eq!(mismatched.last_sync_at, None);
    assert!(store.deals_for(886557).await.unwrap().is_empty());

    assert_eq!(classification.changed, 2);
    let client = store.get_account(885822).await.unwrap().unwrap();
    assert_eq!(client.capital_source, CapitalSource::Client);
    assert_eq!(client.initial_allocation, Decimal::new(100_000, 0));
    let separation = store.get_account(886528).await.unwrap().unwrap();
    assert_eq!(separation.capital_source, CapitalSource::Separation);
}

#[tokio::test]
async fn test_reports_after_sync() {
    let Fixture { service, .. } = fixture();
    service.seed().await.unwrap();
    service.sync_once().await.unwrap();

    let tiers = service.tier_report().await.unwrap();
    assert_eq!(tiers.client.initial_allocation, Decimal::new(100_000, 0));
    assert_eq!(tiers.client.profit_withdrawals, Decimal::new(2_000, 0));
    assert_eq!(tiers.client.true_pnl, Decimal::new(1_500, 0));
    assert_eq!(tiers.total_fund.true_pnl, Decimal::new(1_500, 0));
    assert_eq!(tiers.separation_balance, Decimal::new(2_000, 0));

    let owned = service.owner_report("Alejandro Mariscal").await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].capital_source, CapitalSource::Client);

    let reconciliation = service.reconcile().await.unwrap();
    assert!(reconciliation.is_consistent());

    let status = service.status().await.unwrap();
    assert_eq!(status.active_accounts, 3);
    assert_eq!(status.connected, 2);
    assert_eq!(status.never_synced, 1);
    assert_eq!(status.terminals.len(), 1);
    assert_eq!(status.accounts[0].last_ticket, Some(5002));
}

#[tokio::test]
async fn test_mismatch_reaches_watchdog() {
    let Fixture { service, store } = fixture();
    service.seed().await.unwrap();
    service.sync_once().await.unwrap();

    let health = service.health().await.unwrap();
    assert!(!health.overall_healthy);
    assert_eq!(health.expected_accounts, 3);
    assert_eq!(health.fresh_accounts, 2);
    assert!(health
        .breaches
        .iter()
        .any(|b| matches!(b, Breach::UnacknowledgedEscalation { account_number: 886557, .. })));
    assert_eq!(service.watchdog.state().await, WatchdogState::Degraded { checks: 1 });

    assert_eq!(service.watchdog.acknowledge(886557).await, 1);
    let health = service.health().await.unwrap();
    assert!(health.breaches.iter().all(|b| matches!(b, Breach::LowCoverage { .. })));

    let mismatched = store.get_account(886557).await.unwrap().unwrap();
    assert_eq!(mismatched.connection_status, ConnectionStatus::Pending);
}
