//! Interval-driven sync passes

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::orchestrator::{SyncOrchestrator, SyncReport};

/// Notified after every completed pass
#[async_trait]
pub trait PassListener: Send + Sync {
    async fn on_pass(&self, report: &SyncReport);
}

pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    interval: Duration,
    listeners: Vec<Arc<dyn PassListener>>,
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        let interval = orchestrator.config().interval();
        Self { orchestrator, interval, listeners: Vec::new() }
    }

    pub fn with_listener(mut self, listener: Arc<dyn PassListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Run passes until `shutdown` flips to true; a pass in progress is finished first
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting sync scheduler");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.orchestrator.run_pass().await {
                        Ok(report) => {
                            for listener in &self.listeners {
                                listener.on_pass(&report).await;
                            }
                        }
                        Err(e) => error!("Sync pass failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Sync scheduler stopped");
    }
}
