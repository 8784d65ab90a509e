//! Terminal Session Broker
//!
//! Each physical terminal can be authenticated as one account at a time. The broker
//! owns one slot per server behind a FIFO `tokio::sync::Mutex`; holding the slot's
//! guard is holding the terminal. A [`TerminalLease`] wraps the guard, and a
//! [`TerminalSession`] wraps a lease whose terminal has been verified to be logged
//! in as the requested account.

use chrono::{DateTime, Utc};
use ledger::AccountNumber;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::bridge::{AccountInfo, Credentials, DealHistory, Identified, TerminalBridge};
use crate::config::BrokerConfig;
use crate::error::{Result, TerminalError};
use crate::http::HttpBridge;
use crate::retry::RetryPolicy;

struct TerminalSlot {
    bridge: Arc<dyn TerminalBridge>,
    /// Account the terminal was last verified to be authenticated as
    logged_in: Option<AccountNumber>,
}

/// Result of probing one terminal
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TerminalHealth {
    pub server: String,
    pub reachable: bool,
    /// The terminal was leased to a sync and was not probed
    pub busy: bool,
    pub logged_in: Option<AccountNumber>,
    pub detail: Option<String>,
}

/// Exclusive hold on one terminal; released on drop
pub struct TerminalLease {
    server: String,
    guard: Option<OwnedMutexGuard<TerminalSlot>>,
    acquired_at: Instant,
}

impl TerminalLease {
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }

    /// Give the terminal back; calling it again is a no-op
    pub fn release(&mut self) {
        if self.guard.take().is_some() {
            debug!(server = %self.server, held_ms = self.acquired_at.elapsed().as_millis() as u64, "Terminal released");
        }
    }

    fn slot(&mut self) -> Result<&mut TerminalSlot> {
        self.guard
            .as_deref_mut()
            .ok_or_else(|| TerminalError::Protocol(format!("lease on '{}' already released", self.server)))
    }
}

impl Drop for TerminalLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for TerminalLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalLease").field("server", &self.server).field("held", &self.is_held()).finish()
    }
}

/// A terminal leased and verified to be authenticated as one account
///
/// Every read is identity-checked against the requested account before it is
/// returned. A mismatch poisons the session so the terminal is re-authenticated by
/// the next caller.
pub struct TerminalSession {
    lease: TerminalLease,
    bridge: Arc<dyn TerminalBridge>,
    account: AccountNumber,
    call_timeout: Duration,
    mismatched: AtomicBool,
}

impl TerminalSession {
    pub fn account(&self) -> AccountNumber {
        self.account
    }

    pub fn server(&self) -> &str {
        self.lease.server()
    }

    pub async fn account_info(&self) -> Result<AccountInfo> {
        let info = timed(self.call_timeout, "account_info", self.bridge.account_info(self.account)).await?;
        self.verify(info)
    }

    pub async fn deal_history(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<DealHistory> {
        let history =
            timed(self.call_timeout, "deal_history", self.bridge.deal_history(self.account, from, to)).await?;
        self.verify(history)
    }

    /// End the session and release the terminal
    pub fn close(self) {}

    fn verify<T: Identified>(&self, response: T) -> Result<T> {
        let reported = response.login();
        if reported != self.account {
            self.mismatched.store(true, Ordering::SeqCst);
            warn!(server = %self.server(), requested = self.account, reported, "Terminal identity changed mid-session");
            return Err(TerminalError::AccountMismatch { requested: self.account, reported });
        }
        Ok(response)
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        if self.mismatched.load(Ordering::SeqCst) {
            if let Ok(slot) = self.lease.slot() {
                slot.logged_in = None;
            }
        }
    }
}

async fn timed<T>(limit: Duration, operation: &'static str, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TerminalError::Timeout { operation, after: limit }),
    }
}

/// Serializes access to a fixed set of terminals, one per trading server
pub struct TerminalBroker {
    terminals: HashMap<String, Arc<Mutex<TerminalSlot>>>,
    call_timeout: Duration,
    login_retry: RetryPolicy,
}

impl TerminalBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            terminals: HashMap::new(),
            call_timeout: config.call_timeout(),
            login_retry: config.login_retry.clone(),
        }
    }

    /// Build a broker with an [`HttpBridge`] for every configured endpoint
    pub fn connect_http(config: &BrokerConfig) -> Result<Self> {
        let mut broker = Self::new(config);
        for endpoint in &config.terminals {
            let bridge = HttpBridge::new(&endpoint.base_url, config.call_timeout())?;
            broker.register(endpoint.server.clone(), Arc::new(bridge));
            info!(server = %endpoint.server, base_url = %endpoint.base_url, "Terminal registered");
        }
        Ok(broker)
    }

    /// Attach the terminal serving `server`, replacing any previous one
    pub fn register(&mut self, server: impl Into<String>, bridge: Arc<dyn TerminalBridge>) {
        self.terminals.insert(server.into(), Arc::new(Mutex::new(TerminalSlot { bridge, logged_in: None })));
    }

    pub fn with_terminal(mut self, server: impl Into<String>, bridge: Arc<dyn TerminalBridge>) -> Self {
        self.register(server, bridge);
        self
    }

    pub fn servers(&self) -> Vec<String> {
        let mut servers: Vec<String> = self.terminals.keys().cloned().collect();
        servers.sort();
        servers
    }

    pub fn has_server(&self, server: &str) -> bool {
        self.terminals.contains_key(server)
    }

    /// Wait for exclusive use of the terminal serving `server`
    pub async fn acquire(&self, server: &str) -> Result<TerminalLease> {
        let slot = self
            .terminals
            .get(server)
            .ok_or_else(|| TerminalError::UnknownServer(server.to_string()))?;

        let guard = Arc::clone(slot).lock_owned().await;
        debug!(server, "Terminal acquired");
        Ok(TerminalLease { server: server.to_string(), guard: Some(guard), acquired_at: Instant::now() })
    }

    pub fn release(&self, lease: &mut TerminalLease) {
        lease.release();
    }

    /// Lease the terminal and make sure it is authenticated as `account`
    ///
    /// A cached login is reused only after `account_info` confirms the terminal still
    /// reports `account`. Login failures are retried per the login policy; an
    /// identity mismatch is returned immediately.
    pub async fn open_session(
        &self,
        server: &str,
        account: AccountNumber,
        credentials: &Credentials,
    ) -> Result<TerminalSession> {
        let mut lease = self.acquire(server).await?;
        let call_timeout = self.call_timeout;

        let slot = lease.slot()?;
        let bridge = Arc::clone(&slot.bridge);

        let verified = match slot.logged_in {
            Some(current) if current == account => {
                match timed(call_timeout, "account_info", bridge.account_info(account)).await {
                    Ok(info) if info.login == account => true,
                    Ok(info) => {
                        debug!(server, account, reported = info.login, "Cached login is stale");
                        false
                    }
                    Err(e) => {
                        debug!(server, account, "Cached login could not be verified: {}", e);
                        false
                    }
                }
            }
            _ => false,
        };

        if !verified {
            slot.logged_in = None;

            let terminal = bridge.as_ref();
            let response = self
                .login_retry
                .run("login", move || timed(call_timeout, "login", terminal.login(account, credentials, server)))
                .await?;
            if response.login != account {
                warn!(server, requested = account, reported = response.login, "Terminal logged in as a different account");
                return Err(TerminalError::AccountMismatch { requested: account, reported: response.login });
            }

            let info = timed(call_timeout, "account_info", bridge.account_info(account)).await?;
            if info.login != account {
                warn!(server, requested = account, reported = info.login, "Terminal reports a different account after login");
                return Err(TerminalError::AccountMismatch { requested: account, reported: info.login });
            }

            slot.logged_in = Some(account);
            debug!(server, account, "Terminal authenticated");
        }

        Ok(TerminalSession { lease, bridge, account, call_timeout, mismatched: AtomicBool::new(false) })
    }

    /// Run `op` against a verified session for `account` on `server`
    ///
    /// The terminal is released when `op` completes, fails, or is dropped.
    pub async fn with_account<T, F, Fut>(
        &self,
        server: &str,
        account: AccountNumber,
        credentials: &Credentials,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(TerminalSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.open_session(server, account, credentials).await?;
        op(session).await
    }

    /// Probe every terminal that is not currently leased
    pub async fn health(&self) -> Vec<TerminalHealth> {
        let mut report = Vec::with_capacity(self.terminals.len());
        for server in self.servers() {
            let Some(slot) = self.terminals.get(&server) else { continue };
            let entry = match Arc::clone(slot).try_lock_owned() {
                Err(_) => TerminalHealth { server, reachable: true, busy: true, logged_in: None, detail: None },
                Ok(guard) => match timed(self.call_timeout, "health", guard.bridge.health()).await {
                    Ok(status) => TerminalHealth {
                        server,
                        reachable: status.connected,
                        busy: false,
                        logged_in: guard.logged_in,
                        detail: None,
                    },
                    Err(e) => TerminalHealth {
                        server,
                        reachable: false,
                        busy: false,
                        logged_in: guard.logged_in,
                        detail: Some(e.to_string()),
                    },
                },
            };
            report.push(entry);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeTerminal;
    use futures::future::join_all;
    use rust_decimal::Decimal;

    const SERVER: &str = "MEXAtlantic-Real";

    fn config() -> BrokerConfig {
        BrokerConfig {
            call_timeout_secs: 5,
            login_retry: RetryPolicy { max_attempts: 3, base_delay_ms: 100, multiplier: 2.0, max_delay_ms: 1_000 },
            terminals: Vec::new(),
        }
    }

    fn creds() -> Credentials {
        Credentials::new("secret")
    }

    fn fake_with_accounts(accounts: &[AccountNumber]) -> Arc<FakeTerminal> {
        let fake = FakeTerminal::new(SERVER).with_latency(Duration::from_millis(5));
        for &account in accounts {
            fake.add_account(account, "secret", Decimal::new(10_000, 0));
        }
        Arc::new(fake)
    }

    fn broker_for(fake: &Arc<FakeTerminal>) -> TerminalBroker {
        TerminalBroker::new(&config()).with_terminal(SERVER, fake.clone())
    }

    #[tokio::test]
    async fn test_concurrent_syncs_never_overlap_on_one_terminal() {
        let accounts: Vec<AccountNumber> = (885_800..885_808).collect();
        let fake = fake_with_accounts(&accounts);
        let broker = Arc::new(broker_for(&fake));

        let tasks = accounts.iter().map(|&account| {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .with_account(SERVER, account, &creds(), |session| async move {
                        let info = session.account_info().await?;
                        session.deal_history(Utc::now() - chrono::Duration::days(30), Utc::now()).await?;
                        Ok(info.login)
                    })
                    .await
            })
        });

        for (joined, expected) in join_all(tasks).await.into_iter().zip(&accounts) {
            assert_eq!(joined.unwrap().unwrap(), *expected);
        }
        assert_eq!(fake.max_concurrency(), 1);
        assert_eq!(fake.overlap_count(), 0);
    }

    #[tokio::test]
    async fn test_identity_mismatch_aborts_and_forces_relogin() {
        let fake = fake_with_accounts(&[885822, 886557]);
        fake.impersonate(885822, 886557);
        let broker = broker_for(&fake);

        let result = broker.with_account(SERVER, 885822, &creds(), |session| async move { session.account_info().await }).await;
        assert_eq!(result.unwrap_err(), TerminalError::AccountMismatch { requested: 885822, reported: 886557 });
        assert_eq!(fake.login_calls(), 1);

        // The terminal is free again and the next caller logs in afresh
        fake.clear_impersonation(885822);
        let info = broker
            .with_account(SERVER, 885822, &creds(), |session| async move { session.account_info().await })
            .await
            .unwrap();
        assert_eq!(info.login, 885822);
        assert_eq!(fake.login_calls(), 2);
    }

    #[tokio::test]
    async fn test_mid_session_switch_is_detected() {
        let fake = fake_with_accounts(&[885822, 886557]);
        let broker = broker_for(&fake);

        let result = broker
            .with_account(SERVER, 885822, &creds(), |session| {
                let fake = fake.clone();
                async move {
                    fake.switch_to(886557);
                    session.account_info().await
                }
            })
            .await;
        assert!(matches!(result, Err(TerminalError::AccountMismatch { requested: 885822, reported: 886557 })));

        broker.with_account(SERVER, 885822, &creds(), |_| async { Ok(()) }).await.unwrap();
        assert_eq!(fake.login_calls(), 2);
    }

    #[tokio::test]
    async fn test_verified_login_is_reused() {
        let fake = fake_with_accounts(&[885822]);
        let broker = broker_for(&fake);

        for _ in 0..3 {
            broker.with_account(SERVER, 885822, &creds(), |_| async { Ok(()) }).await.unwrap();
        }
        assert_eq!(fake.login_calls(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let fake = fake_with_accounts(&[885822]);
        let broker = broker_for(&fake);

        let result = broker.with_account(SERVER, 885822, &Credentials::new("wrong"), |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(TerminalError::AuthFailed { account: 885822, .. })));
        assert_eq!(fake.login_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_login_retries_then_surfaces() {
        let fake = fake_with_accounts(&[885822]);
        fake.fail_logins(885822, 10);
        let broker = broker_for(&fake);

        let result = broker.with_account(SERVER, 885822, &creds(), |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(TerminalError::Unreachable(_))));
        assert_eq!(fake.login_calls(), 3);

        fake.fail_logins(885822, 1);
        broker.with_account(SERVER, 885822, &creds(), |_| async { Ok(()) }).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_the_terminal() {
        let fake = fake_with_accounts(&[885822, 886557]);
        fake.hang_on(885822);
        let broker = TerminalBroker::new(&BrokerConfig { login_retry: RetryPolicy::none(), ..config() })
            .with_terminal(SERVER, fake.clone());

        let result = broker.with_account(SERVER, 885822, &creds(), |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(TerminalError::Timeout { operation: "login", .. })));

        let lease = broker.acquire(SERVER).await.unwrap();
        assert!(lease.is_held());
    }

    #[tokio::test]
    async fn test_dropped_sync_releases_the_terminal() {
        let fake = fake_with_accounts(&[885822]);
        let broker = broker_for(&fake);

        let credentials = creds();
        let pending = broker.with_account(SERVER, 885822, &credentials, |session| async move {
            let _session = session;
            std::future::pending::<()>().await;
            Ok(())
        });
        let cancelled = tokio::time::timeout(Duration::from_millis(50), pending).await;
        assert!(cancelled.is_err());

        let lease = tokio::time::timeout(Duration::from_secs(1), broker.acquire(SERVER)).await;
        assert!(lease.is_ok());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let fake = fake_with_accounts(&[]);
        let broker = broker_for(&fake);

        let mut lease = broker.acquire(SERVER).await.unwrap();
        broker.release(&mut lease);
        broker.release(&mut lease);
        assert!(!lease.is_held());

        let second = broker.acquire(SERVER).await.unwrap();
        assert!(second.is_held());
    }

    #[tokio::test]
    async fn test_unknown_server_is_rejected() {
        let fake = fake_with_accounts(&[]);
        let broker = broker_for(&fake);
        assert_eq!(
            broker.acquire("Nowhere-Live").await.unwrap_err(),
            TerminalError::UnknownServer("Nowhere-Live".to_string())
        );
    }

    #[tokio::test]
    async fn test_health_skips_leased_terminals() {
        let fake = fake_with_accounts(&[885822]);
        let broker = broker_for(&fake);

        let report = broker.health().await;
        assert_eq!(report.len(), 1);
        assert!(report[0].reachable && !report[0].busy);

        let _lease = broker.acquire(SERVER).await.unwrap();
        let report = broker.health().await;
        assert!(report[0].busy);
    }
}
