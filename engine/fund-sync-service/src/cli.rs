//! Command line interface
//!
//! `run` is the long-lived service; every other command performs one operation
//! and prints its result as JSON on stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use account_sync::SyncReport;
use capital_classifier::{ClassificationReport, ReconciliationReport};

use crate::service::FundSyncService;
use crate::signals::{graceful_shutdown, setup_signal_handlers, wait_for_shutdown};

/// Managed-account sync engine
#[derive(Debug, Parser)]
#[command(name = "fund-sync")]
#[command(about = "Keeps the managed-account ledger in sync with the trading terminals")]
#[command(version)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Account roster, overriding `service.roster_path`
    #[arg(short, long, global = true)]
    pub roster: Option<PathBuf>,

    /// Use an in-memory ledger; terminals are read but nothing is persisted
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Commands {
    /// Run the sync scheduler and health watchdog until SIGINT/SIGTERM
    Run,
    /// Run a single sync pass and reclassify
    SyncOnce,
    /// Reclassify every account
    Classify {
        /// Also compare stored allocations with deposit evidence
        #[arg(long)]
        reconcile: bool,
    },
    /// Show tiered profit/loss
    Pnl {
        /// Restrict to one owner's accounts
        #[arg(long)]
        owner: Option<String>,
        /// Break down by fund code instead of tier
        #[arg(long, conflicts_with = "owner")]
        funds: bool,
    },
    /// Run one health check
    Health,
    /// Show per-account sync status and terminal health
    Status,
}

impl Commands {
    /// Commands that write the roster to the ledger before running
    pub fn seeds_roster(&self) -> bool {
        matches!(self, Commands::Run | Commands::SyncOnce)
    }
}

#[derive(Serialize)]
struct SyncOnceOutput<'a> {
    sync: &'a SyncReport,
    classification: &'a ClassificationReport,
}

#[derive(Serialize)]
struct ClassifyOutput<'a> {
    classification: &'a ClassificationReport,
    reconciliation: &'a ReconciliationReport,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}

/// Execute one command against a wired service
pub async fn execute(service: Arc<FundSyncService>, command: Commands, dry_run: bool) -> Result<()> {
    if command.seeds_roster() || dry_run {
        service.seed().await?;
    }

    match command {
        Commands::Run => run(service).await,
        Commands::SyncOnce => {
            let (report, classification) = service.sync_once().await?;
            info!(
                synced = report.synced(),
                failed = report.failed(),
                stale = report.stale(),
                new_deals = report.new_deals(),
                "Sync pass complete"
            );
            print_json(&SyncOnceOutput { sync: &report, classification: &classification })
        }
        Commands::Classify { reconcile } => {
            let classification = service.classify().await?;
            if reconcile {
                let reconciliation = service.reconcile().await?;
                print_json(&ClassifyOutput { classification: &classification, reconciliation: &reconciliation })
            } else {
                print_json(&classification)
            }
        }
        Commands::Pnl { owner: Some(owner), .. } => print_json(&service.owner_report(&owner).await?),
        Commands::Pnl { funds: true, .. } => print_json(&service.fund_report().await?),
        Commands::Pnl { .. } => print_json(&service.tier_report().await?),
        Commands::Health => print_json(&service.health().await?),
        Commands::Status => print_json(&service.status().await?),
    }
}

async fn run(service: Arc<FundSyncService>) -> Result<()> {
    let mut shutdown = setup_signal_handlers()?;
    info!("Signal handlers configured");

    let tasks = service.spawn_loops(shutdown.clone());
    info!("Fund sync service is running. Press Ctrl+C to shutdown gracefully.");

    wait_for_shutdown(&mut shutdown).await;
    info!("Shutdown signal received. Initiating graceful shutdown...");
    graceful_shutdown(tasks, service.config.service.shutdown_timeout()).await;
    Ok(())
}
