//! Escalations raised by the orchestrator

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger::AccountNumber;
use serde::Serialize;
use tracing::error;

use crate::error::FailureKind;

/// An account whose failures need attention beyond the retry budget
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Escalation {
    pub account_number: AccountNumber,
    pub server: String,
    pub kind: FailureKind,
    pub reason: String,
    pub consecutive_failures: u32,
    pub raised_at: DateTime<Utc>,
}

/// Receives escalations; the health watchdog is the production sink
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn escalate(&self, escalation: Escalation);
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEscalation;

#[async_trait]
impl EscalationSink for LogEscalation {
    async fn escalate(&self, escalation: Escalation) {
        error!(
            account = escalation.account_number,
            server = %escalation.server,
            kind = %escalation.kind,
            failures = escalation.consecutive_failures,
            "Sync escalation: {}",
            escalation.reason
        );
    }
}
