//! Fund Sync Service
//!
//! Entry point for the managed-account sync engine.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use fund_sync_service::cli::{self, Cli};
use fund_sync_service::{initialize_logging, load_configuration, FundSyncService, Roster};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = load_configuration(cli.config.as_deref())?;
    if let Some(roster) = &cli.roster {
        config.service.roster_path = roster.clone();
    }

    initialize_logging(&config.logging)?;
    info!("Starting Fund Sync Service v{}", env!("CARGO_PKG_VERSION"));

    let roster = Roster::load(&config.service.roster_path).context("Failed to load account roster")?;
    info!(accounts = roster.accounts.len(), "Roster loaded");

    let service = Arc::new(FundSyncService::connect(config, roster, cli.dry_run).await?);
    cli::execute(service, cli.command, cli.dry_run).await
}
