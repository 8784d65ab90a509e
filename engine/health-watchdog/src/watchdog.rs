//! Health Watchdog
//!
//! Read-only over the ledger. Each check measures how many expected accounts are
//! fresh and connected, folds in unacknowledged correctness escalations from the
//! orchestrator, and drives the [`HealthStateMachine`]; remediation goes through a
//! [`RemediationHook`] and is rate-limited by the machine's cooldown.

use account_sync::{Escalation, EscalationSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger::{AccountNumber, ConnectionStatus, LedgerSnapshot, LedgerStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::WatchdogConfig;
use crate::error::Result;
use crate::remediation::{RemediationHook, RemediationRequest};
use crate::state::{HealingPolicy, HealthStateMachine, WatchdogState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountHealth {
    pub account_number: AccountNumber,
    pub server: String,
    pub fresh: bool,
    pub connection_status: ConnectionStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_age_secs: Option<i64>,
    pub consecutive_failures: u32,
    pub status_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "breach", rename_all = "snake_case")]
pub enum Breach {
    LowCoverage { coverage: f64, min_coverage: f64 },
    UnacknowledgedEscalation { account_number: AccountNumber, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "healing", rename_all = "snake_case")]
pub enum HealingOutcome {
    Triggered { hook: String },
    CoolingDown { remaining_secs: u64 },
    Failed { hook: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub overall_healthy: bool,
    pub state: WatchdogState,
    pub expected_accounts: usize,
    pub active_accounts: usize,
    pub fresh_accounts: usize,
    pub coverage: f64,
    /// Consecutive breached checks, including this one
    pub consecutive_failure_count: u32,
    pub breaches: Vec<Breach>,
    pub accounts: Vec<AccountHealth>,
    pub healing: Option<HealingOutcome>,
}

/// Compute coverage and per-account freshness from one snapshot
pub fn assess(
    snapshot: &LedgerSnapshot,
    expected_accounts: usize,
    max_age: chrono::Duration,
    now: DateTime<Utc>,
) -> (Vec<AccountHealth>, f64) {
    let accounts: Vec<AccountHealth> = snapshot
        .active_accounts()
        .map(|a| AccountHealth {
            account_number: a.account_number,
            server: a.server.clone(),
            fresh: a.is_fresh(now, max_age),
            connection_status: a.connection_status,
            last_sync_at: a.last_sync_at,
            sync_age_secs: a.last_sync_at.map(|at| (now - at).num_seconds()),
            consecutive_failures: a.consecutive_failures,
            status_reason: a.status_reason.clone(),
        })
        .collect();

    let fresh = accounts.iter().filter(|a| a.fresh).count();
    let denominator = expected_accounts.max(accounts.len());
    let coverage = if denominator == 0 { 1.0 } else { fresh as f64 / denominator as f64 };
    (accounts, coverage)
}

pub struct HealthWatchdog {
    store: Arc<dyn LedgerStore>,
    hook: Arc<dyn RemediationHook>,
    config: WatchdogConfig,
    expected_accounts: usize,
    machine: Mutex<HealthStateMachine>,
    escalations: Mutex<Vec<Escalation>>,
}

impl HealthWatchdog {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        hook: Arc<dyn RemediationHook>,
        config: WatchdogConfig,
        expected_accounts: usize,
    ) -> Self {
        let policy = HealingPolicy {
            threshold: config.degraded_checks_before_healing,
            cooldown: config.healing_cooldown(),
            multiplier: config.backoff_multiplier,
            max_cooldown: config.max_cooldown(),
        };
        Self {
            store,
            hook,
            config,
            expected_accounts,
            machine: Mutex::new(HealthStateMachine::new(policy)),
            escalations: Mutex::new(Vec::new()),
        }
    }

    pub async fn state(&self) -> WatchdogState {
        self.machine.lock().await.state()
    }

    /// Escalations received and not yet acknowledged
    pub async fn pending_escalations(&self) -> Vec<Escalation> {
        self.escalations.lock().await.clone()
    }

    /// Clear escalations for one account; returns how many were cleared
    pub async fn acknowledge(&self, account_number: AccountNumber) -> usize {
        let mut escalations = self.escalations.lock().await;
        let before = escalations.len();
        escalations.retain(|e| e.account_number != account_number);
        before - escalations.len()
    }

    pub async fn check_health(&self) -> Result<HealthReport> {
        let snapshot = self.store.snapshot().await?;
        let now = Utc::now();
        let (accounts, coverage) = assess(&snapshot, self.expected_accounts, self.config.max_sync_age(), now);

        let mut escalations = self.escalations.lock().await;
        escalations.retain(|e| {
            let cleared = synced_since(&snapshot, e.account_number, e.raised_at);
            if cleared {
                info!(account = e.account_number, kind = %e.kind, "Escalation cleared by a later clean sync");
            }
            !cleared
        });

        let mut breaches = Vec::new();
        if coverage < self.config.min_coverage {
            breaches.push(Breach::LowCoverage { coverage, min_coverage: self.config.min_coverage });
        }
        for escalation in escalations.iter().filter(|e| e.kind.is_correctness()) {
            breaches.push(Breach::UnacknowledgedEscalation {
                account_number: escalation.account_number,
                reason: escalation.reason.clone(),
            });
        }
        drop(escalations);

        let mut machine = self.machine.lock().await;
        let should_heal = machine.observe(!breaches.is_empty(), Instant::now());
        let healing = if should_heal {
            let reason = describe(&breaches);
            let context = serde_json::json!({
                "coverage": coverage,
                "expected_accounts": self.expected_accounts,
                "degraded_checks": machine.degraded_checks(),
                "breaches": &breaches,
            });
            Some(self.invoke_hook(&mut machine, reason, context).await)
        } else {
            None
        };

        let report = HealthReport {
            checked_at: now,
            overall_healthy: breaches.is_empty(),
            state: machine.state(),
            expected_accounts: self.expected_accounts,
            active_accounts: accounts.len(),
            fresh_accounts: accounts.iter().filter(|a| a.fresh).count(),
            coverage,
            consecutive_failure_count: machine.degraded_checks(),
            breaches,
            accounts,
            healing,
        };
        drop(machine);

        if report.overall_healthy {
            info!(coverage = report.coverage, fresh = report.fresh_accounts, "Health check passed");
        } else {
            warn!(
                coverage = report.coverage,
                fresh = report.fresh_accounts,
                degraded_checks = report.consecutive_failure_count,
                breaches = report.breaches.len(),
                "Health check degraded"
            );
        }
        Ok(report)
    }

    /// Request remediation unless the cooldown window is still open
    pub async fn trigger_auto_healing(&self, reason: &str, context: serde_json::Value) -> HealingOutcome {
        let mut machine = self.machine.lock().await;
        if let Some(remaining) = machine.cooldown_remaining(Instant::now()) {
            info!(remaining_secs = remaining.as_secs(), "Remediation suppressed by cooldown");
            return HealingOutcome::CoolingDown { remaining_secs: remaining.as_secs() };
        }
        self.invoke_hook(&mut machine, reason.to_string(), context).await
    }

    async fn invoke_hook(
        &self,
        machine: &mut HealthStateMachine,
        reason: String,
        context: serde_json::Value,
    ) -> HealingOutcome {
        machine.mark_triggered(Instant::now());
        let request = RemediationRequest { reason, context, requested_at: Utc::now() };
        let hook = self.hook.name().to_string();
        match self.hook.remediate(&request).await {
            Ok(()) => {
                warn!(%hook, reason = %request.reason, state = ?machine.state(), "Auto-healing triggered");
                HealingOutcome::Triggered { hook }
            }
            Err(e) => {
                error!(%hook, "Remediation hook failed: {}", e);
                HealingOutcome::Failed { hook, error: e.to_string() }
            }
        }
    }

    /// Check on a fixed interval until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = period.as_secs(), "Starting health watchdog");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_health().await {
                        error!("Health check failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Health watchdog stopped");
    }
}

/// Whether the account has synced cleanly after `since`
fn synced_since(snapshot: &LedgerSnapshot, account_number: AccountNumber, since: DateTime<Utc>) -> bool {
    snapshot.account(account_number).is_some_and(|a| {
        a.connection_status == ConnectionStatus::Connected && a.last_sync_at.is_some_and(|at| at > since)
    })
}

fn describe(breaches: &[Breach]) -> String {
    breaches
        .iter()
        .map(|b| match b {
            Breach::LowCoverage { coverage, min_coverage } => {
                format!("sync coverage {:.1}% below {:.1}%", coverage * 100.0, min_coverage * 100.0)
            }
            Breach::UnacknowledgedEscalation { account_number, reason } => {
                format!("account {account_number}: {reason}")
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[async_trait]
impl EscalationSink for HealthWatchdog {
    async fn escalate(&self, escalation: Escalation) {
        warn!(
            account = escalation.account_number,
            kind = %escalation.kind,
            failures = escalation.consecutive_failures,
            "Escalation received: {}",
            escalation.reason
        );
        let mut escalations = self.escalations.lock().await;
        escalations.retain(|e| !(e.account_number == escalation.account_number && e.kind == escalation.kind));
        escalations.push(escalation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_sync::FailureKind;
    use ledger::{InMemoryLedger, LiveFields, ManagedAccount};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHook {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemediationHook for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        async fn remediate(&self, _request: &RemediationRequest) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            min_coverage: 0.9,
            degraded_checks_before_healing: 3,
            healing_cooldown_secs: 600,
            backoff_multiplier: 2.0,
            max_cooldown_secs: 3600,
            ..WatchdogConfig::default()
        }
    }

    async fn store_with(accounts: &[AccountNumber]) -> Arc<InMemoryLedger> {
        let store = Arc::new(InMemoryLedger::new());
        for &n in accounts {
            store.register_account(&ManagedAccount::new(n, "MEXAtlantic", "MEXAtlantic-Real", "CORE")).await.unwrap();
        }
        store
    }

    async fn mark_synced(store: &InMemoryLedger, account: AccountNumber) {
        let fields = LiveFields {
            balance: Decimal::ONE,
            equity: Decimal::ONE,
            margin: Decimal::ZERO,
            profit: Decimal::ZERO,
            currency: None,
            leverage: None,
            as_of: Utc::now(),
        };
        store.update_live_fields(account, &fields).await.unwrap();
    }

    fn mismatch(account_number: AccountNumber) -> Escalation {
        Escalation {
            account_number,
            server: "MEXAtlantic-Real".into(),
            kind: FailureKind::AccountMismatch,
            reason: "terminal reports 886557 while 885822 was requested".into(),
            consecutive_failures: 0,
            raised_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_degraded_checks_heal_once_then_cooldown() {
        let store = store_with(&[885822, 886557]).await;
        let hook = Arc::new(CountingHook::default());
        let watchdog = HealthWatchdog::new(store, hook.clone(), config(), 2);

        for _ in 0..3 {
            let report = watchdog.check_health().await.unwrap();
            assert!(!report.overall_healthy);
        }
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        assert_eq!(watchdog.state().await, WatchdogState::HealingTriggered { level: 0 });

        let fourth = watchdog.check_health().await.unwrap();
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fourth.healing, None);
        assert_eq!(fourth.consecutive_failure_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_still_degraded_reescalates_with_backoff() {
        let store = store_with(&[885822]).await;
        let hook = Arc::new(CountingHook::default());
        let watchdog = HealthWatchdog::new(store, hook.clone(), config(), 1);

        for _ in 0..3 {
            watchdog.check_health().await.unwrap();
        }
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(600)).await;
        watchdog.check_health().await.unwrap();
        assert_eq!(hook.calls.load(Ordering::SeqCst), 2);
        assert_eq!(watchdog.state().await, WatchdogState::HealingTriggered { level: 1 });

        // The window has doubled
        tokio::time::advance(Duration::from_secs(900)).await;
        watchdog.check_health().await.unwrap();
        assert_eq!(hook.calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(300)).await;
        watchdog.check_health().await.unwrap();
        assert_eq!(hook.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_clean_check_returns_to_healthy() {
        let store = store_with(&[885822]).await;
        let watchdog = HealthWatchdog::new(store.clone(), Arc::new(CountingHook::default()), config(), 1);

        watchdog.check_health().await.unwrap();
        assert_eq!(watchdog.state().await, WatchdogState::Degraded { checks: 1 });

        mark_synced(&store, 885822).await;
        let report = watchdog.check_health().await.unwrap();
        assert!(report.overall_healthy);
        assert_eq!(report.coverage, 1.0);
        assert_eq!(watchdog.state().await, WatchdogState::Healthy);
    }

    #[tokio::test]
    async fn test_missing_roster_accounts_count_against_coverage() {
        let store = store_with(&[1, 2, 3]).await;
        for n in [1, 2, 3] {
            mark_synced(&store, n).await;
        }
        let watchdog = HealthWatchdog::new(store, Arc::new(CountingHook::default()), config(), 4);

        let report = watchdog.check_health().await.unwrap();
        assert_eq!(report.fresh_accounts, 3);
        assert_eq!(report.coverage, 0.75);
        assert!(matches!(report.breaches[0], Breach::LowCoverage { .. }));
    }

    #[tokio::test]
    async fn test_mismatch_escalation_breaches_until_acknowledged() {
        let store = store_with(&[885822]).await;
        mark_synced(&store, 885822).await;
        let watchdog = HealthWatchdog::new(store, Arc::new(CountingHook::default()), config(), 1);

        watchdog.escalate(mismatch(885822)).await;
        let report = watchdog.check_health().await.unwrap();
        assert!(!report.overall_healthy);
        assert!(matches!(
            report.breaches.as_slice(),
            [Breach::UnacknowledgedEscalation { account_number: 885822, .. }]
        ));

        assert_eq!(watchdog.acknowledge(885822).await, 1);
        assert!(watchdog.check_health().await.unwrap().overall_healthy);
    }

    #[tokio::test]
    async fn test_clean_sync_after_mismatch_clears_escalation() {
        let store = store_with(&[885822]).await;
        let watchdog = HealthWatchdog::new(store.clone(), Arc::new(CountingHook::default()), config(), 1);

        let mut escalation = mismatch(885822);
        escalation.raised_at = Utc::now() - chrono::Duration::seconds(30);
        watchdog.escalate(escalation).await;
        assert!(!watchdog.check_health().await.unwrap().overall_healthy);
        assert_eq!(watchdog.state().await, WatchdogState::Degraded { checks: 1 });

        // The terminal now lands on the right account and the sync goes through
        mark_synced(&store, 885822).await;
        let report = watchdog.check_health().await.unwrap();
        assert!(report.overall_healthy);
        assert!(report.breaches.is_empty());
        assert_eq!(watchdog.state().await, WatchdogState::Healthy);
        assert!(watchdog.pending_escalations().await.is_empty());
    }

    #[tokio::test]
    async fn test_sync_before_escalation_does_not_clear_it() {
        let store = store_with(&[885822]).await;
        mark_synced(&store, 885822).await;
        let watchdog = HealthWatchdog::new(store, Arc::new(CountingHook::default()), config(), 1);

        let mut escalation = mismatch(885822);
        escalation.raised_at = Utc::now() + chrono::Duration::seconds(1);
        watchdog.escalate(escalation).await;

        assert!(!watchdog.check_health().await.unwrap().overall_healthy);
        assert_eq!(watchdog.pending_escalations().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_respects_cooldown() {
        let store = store_with(&[]).await;
        let hook = Arc::new(CountingHook::default());
        let watchdog = HealthWatchdog::new(store, hook.clone(), config(), 0);

        let first = watchdog.trigger_auto_healing("operator request", serde_json::json!({})).await;
        assert_eq!(first, HealingOutcome::Triggered { hook: "counting".into() });

        let second = watchdog.trigger_auto_healing("operator request", serde_json::json!({})).await;
        assert!(matches!(second, HealingOutcome::CoolingDown { .. }));
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    }
}
