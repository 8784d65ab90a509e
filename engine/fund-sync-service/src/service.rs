//! Component initialization and wiring

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use account_sync::{CredentialProvider, PassListener, SnapshotFetcher, SyncOrchestrator, SyncReport, SyncScheduler};
use capital_classifier::{CapitalClassifier, ClassificationReport, ReconciliationReport};
use health_watchdog::{HealthReport, HealthWatchdog, LogOnlyHook, RemediationHook, WebhookHook};
use ledger::{CapitalSource, InMemoryLedger, LedgerStore, PgLedger};
use pnl_engine::{PnlCalculator, PnlSnapshot, TierReport, TierSummary};
use terminal_broker::TerminalBroker;

use crate::config::ServiceConfig;
use crate::roster::{Roster, SeedSummary};
use crate::status::FleetStatus;

/// Reclassifies the fleet after every sync pass
struct ReclassifyAfterPass {
    classifier: Arc<CapitalClassifier>,
    store: Arc<dyn LedgerStore>,
}

#[async_trait]
impl PassListener for ReclassifyAfterPass {
    async fn on_pass(&self, report: &SyncReport) {
        if report.synced() == 0 {
            return;
        }
        match self.classifier.reclassify_all(self.store.as_ref()).await {
            Ok(classification) => info!(
                pass_id = %report.pass_id,
                changed = classification.changed,
                unknown = classification.unknown.len(),
                "Fleet reclassified"
            ),
            Err(e) => error!(pass_id = %report.pass_id, "Reclassification failed: {}", e),
        }
    }
}

/// All components of a running service
pub struct FundSyncService {
    pub config: ServiceConfig,
    pub roster: Roster,
    pub store: Arc<dyn LedgerStore>,
    pub broker: Arc<TerminalBroker>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub classifier: Arc<CapitalClassifier>,
    pub pnl: PnlCalculator,
    pub watchdog: Arc<HealthWatchdog>,
}

impl FundSyncService {
    /// Connect to the ledger and the configured terminals
    ///
    /// With `dry_run` the ledger is in-memory: terminals are still read, nothing is persisted.
    pub async fn connect(config: ServiceConfig, roster: Roster, dry_run: bool) -> Result<Self> {
        let store: Arc<dyn LedgerStore> = if dry_run {
            info!("Dry run: using in-memory ledger");
            Arc::new(InMemoryLedger::new())
        } else {
            info!("Connecting to Postgres ledger...");
            Arc::new(PgLedger::connect(&config.database).await.context("Failed to connect to ledger database")?)
        };

        let broker = TerminalBroker::connect_http(&config.broker).context("Failed to create terminal bridges")?;
        let credentials = Arc::new(roster.credentials(&config.service.credential_prefix));
        Self::from_parts(config, roster, store, broker, credentials)
    }

    /// Wire components around an existing store, broker and credential source
    pub fn from_parts(
        config: ServiceConfig,
        roster: Roster,
        store: Arc<dyn LedgerStore>,
        broker: TerminalBroker,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        for server in roster.unserved(&broker.servers()) {
            warn!(%server, "No terminal configured for server; its accounts will fail to sync");
        }

        let hook: Arc<dyn RemediationHook> = match &config.watchdog.webhook_url {
            Some(url) => Arc::new(
                WebhookHook::new(url.clone(), config.watchdog.webhook_timeout())
                    .context("Failed to create remediation webhook client")?,
            ),
            None => Arc::new(LogOnlyHook),
        };

        let expected_accounts = roster.active().count();
        let watchdog = Arc::new(HealthWatchdog::new(store.clone(), hook, config.watchdog.clone(), expected_accounts));

        let broker = Arc::new(broker);
        let fetcher = Arc::new(SnapshotFetcher::new(broker.clone(), credentials, config.sync.fetcher.clone()));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            fetcher,
            watchdog.clone(),
            config.sync.clone(),
        ));

        let classifier = Arc::new(CapitalClassifier::new(config.classifier.clone()));
        let pnl = PnlCalculator::new(classifier.clone());

        info!(
            accounts = expected_accounts,
            terminals = broker.servers().len(),
            "Service components initialized"
        );

        Ok(Self { config, roster, store, broker, orchestrator, classifier, pnl, watchdog })
    }

    /// Upsert the roster into the ledger
    pub async fn seed(&self) -> Result<SeedSummary> {
        self.roster.seed(self.store.as_ref()).await
    }

    /// One sync pass followed by reclassification
    pub async fn sync_once(&self) -> Result<(SyncReport, ClassificationReport)> {
        let report = self.orchestrator.run_pass().await.context("Sync pass failed")?;
        let classification = self.classify().await?;
        Ok((report, classification))
    }

    pub async fn classify(&self) -> Result<ClassificationReport> {
        self.classifier.reclassify_all(self.store.as_ref()).await.context("Classification failed")
    }

    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let snapshot = self.store.snapshot().await?;
        Ok(self.classifier.reconcile(&snapshot))
    }

    pub async fn tier_report(&self) -> Result<TierReport> {
        Ok(self.pnl.tier_report(self.store.as_ref()).await?)
    }

    /// Every tier an owner holds accounts in
    pub async fn owner_report(&self, owner: &str) -> Result<Vec<TierSummary>> {
        let snapshot = self.store.snapshot().await?;
        Ok(CapitalSource::ALL
            .into_iter()
            .map(|source| self.pnl.compute_tier(&snapshot, source, Some(owner)))
            .filter(|summary| summary.totals.account_count > 0)
            .collect())
    }

    pub async fn fund_report(&self) -> Result<Vec<PnlSnapshot>> {
        let snapshot = self.store.snapshot().await?;
        Ok(self.pnl.compute_funds(&snapshot))
    }

    pub async fn health(&self) -> Result<HealthReport> {
        Ok(self.watchdog.check_health().await?)
    }

    pub async fn status(&self) -> Result<FleetStatus> {
        let snapshot = self.store.snapshot().await?;
        let terminals = self.broker.health().await;
        Ok(FleetStatus::from_snapshot(&snapshot, terminals, &self.orchestrator.in_flight()))
    }

    /// Start the sync scheduler and the watchdog loop
    pub fn spawn_loops(&self, shutdown: watch::Receiver<bool>) -> Vec<(&'static str, JoinHandle<()>)> {
        let scheduler = SyncScheduler::new(self.orchestrator.clone()).with_listener(Arc::new(ReclassifyAfterPass {
            classifier: self.classifier.clone(),
            store: self.store.clone(),
        }));
        let sync_handle = tokio::spawn(scheduler.run(shutdown.clone()));

        let watchdog_handle =
            tokio::spawn(self.watchdog.clone().run(self.config.watchdog.check_interval(), shutdown));

        vec![("Sync scheduler", sync_handle), ("Health watchdog", watchdog_handle)]
    }
}
