//! JSON/HTTP client for the terminal bridge

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ledger::AccountNumber;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::bridge::{AccountInfo, Credentials, DealHistory, HealthStatus, LoginResponse, TerminalBridge};
use crate::error::{Result, TerminalError};

#[derive(Serialize)]
struct LoginRequest<'a> {
    login: AccountNumber,
    password: &'a str,
    server: &'a str,
}

/// Bridge to a terminal exposed over HTTP
///
/// `GET /health`, `POST /login`, `GET /account/{login}` and
/// `GET /deals/{login}?from=&to=` with RFC 3339 bounds.
#[derive(Debug, Clone)]
pub struct HttpBridge {
    client: Client,
    base_url: String,
}

impl HttpBridge {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TerminalError::Unreachable(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn deals_path(account: AccountNumber, from: DateTime<Utc>, to: DateTime<Utc>) -> String {
        format!(
            "/deals/{}?from={}&to={}",
            account,
            from.to_rfc3339_opts(SecondsFormat::Secs, true),
            to.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }

    async fn decode<T: DeserializeOwned>(response: Response, account: Option<AccountNumber>) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, account, body));
        }
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Map a non-success HTTP status to the terminal error taxonomy
fn status_error(status: StatusCode, account: Option<AccountNumber>, body: String) -> TerminalError {
    match (status, account) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, Some(account)) => {
            TerminalError::AuthFailed { account, reason: if body.is_empty() { status.to_string() } else { body } }
        }
        (StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT, _) => {
            TerminalError::Timeout { operation: "bridge", after: Duration::ZERO }
        }
        (status, _) if status.is_client_error() => TerminalError::Protocol(format!("{status}: {body}")),
        (status, _) => TerminalError::Unreachable(format!("{status}: {body}")),
    }
}

#[async_trait]
impl TerminalBridge for HttpBridge {
    async fn health(&self) -> Result<HealthStatus> {
        let response = self.client.get(self.url("/health")).send().await?;
        Self::decode(response, None).await
    }

    async fn login(
        &self,
        account: AccountNumber,
        credentials: &Credentials,
        server: &str,
    ) -> Result<LoginResponse> {
        debug!(account, server, base_url = %self.base_url, "Bridge login");
        let request = LoginRequest { login: account, password: credentials.password(), server };
        let response = self.client.post(self.url("/login")).json(&request).send().await?;
        Self::decode(response, Some(account)).await
    }

    async fn account_info(&self, account: AccountNumber) -> Result<AccountInfo> {
        let response = self.client.get(self.url(&format!("/account/{account}"))).send().await?;
        Self::decode(response, Some(account)).await
    }

    async fn deal_history(
        &self,
        account: AccountNumber,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<DealHistory> {
        let response = self.client.get(self.url(&Self::deals_path(account, from, to))).send().await?;
        Self::decode(response, Some(account)).await
    }
}
