//! External remediation hooks

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, WatchdogError};

/// What the watchdog asks the remediation side to act on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemediationRequest {
    pub reason: String,
    pub context: serde_json::Value,
    pub requested_at: DateTime<Utc>,
}

#[async_trait]
pub trait RemediationHook: Send + Sync {
    fn name(&self) -> &str;

    async fn remediate(&self, request: &RemediationRequest) -> Result<()>;
}

/// POSTs the request as JSON to a configured URL
pub struct WebhookHook {
    client: Client,
    url: String,
}

impl WebhookHook {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl RemediationHook for WebhookHook {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn remediate(&self, request: &RemediationRequest) -> Result<()> {
        let response = self.client.post(&self.url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WatchdogError::HookRejected { hook: self.name().to_string(), detail: format!("{status}: {body}") });
        }
        info!(url = %self.url, reason = %request.reason, "Remediation webhook accepted");
        Ok(())
    }
}

/// Records the request in the log and does nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyHook;

#[async_trait]
impl RemediationHook for LogOnlyHook {
    fn name(&self) -> &str {
        "log"
    }

    async fn remediate(&self, request: &RemediationRequest) -> Result<()> {
        warn!(reason = %request.reason, context = %request.context, "Remediation requested");
        Ok(())
    }
}
