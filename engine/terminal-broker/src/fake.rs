//! Instrumented in-memory terminal
//!
//! Behaves like a single-session terminal: `login` switches the authenticated
//! account and reads report whoever is logged in. Overlapping calls are counted
//! and rejected so tests can prove the broker serializes access.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger::{AccountNumber, DealKind, Ticket};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::bridge::{
    AccountInfo, Credentials, DealHistory, DealRecord, HealthStatus, LoginResponse, TerminalBridge,
};
use crate::error::{Result, TerminalError};

struct FakeAccount {
    password: String,
    info: AccountInfo,
    deals: Vec<DealRecord>,
}

#[derive(Default)]
struct FakeState {
    accounts: HashMap<AccountNumber, FakeAccount>,
    logged_in: Option<AccountNumber>,
    /// Logging into the key lands on the value
    impersonations: HashMap<AccountNumber, AccountNumber>,
    failing_logins: HashMap<AccountNumber, u32>,
    hanging: HashSet<AccountNumber>,
    unreachable: bool,
}

/// Fake terminal for one server
pub struct FakeTerminal {
    server: String,
    latency: Duration,
    state: Mutex<FakeState>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    overlaps: AtomicUsize,
    login_calls: AtomicUsize,
    reads: AtomicUsize,
}

struct CallGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeTerminal {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            latency: Duration::ZERO,
            state: Mutex::new(FakeState::default()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    /// Delay every call, widening the window in which overlap would show
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_account(&self, login: AccountNumber, password: &str, balance: Decimal) {
        let info = AccountInfo {
            login,
            balance,
            equity: balance,
            margin: Decimal::ZERO,
            profit: Decimal::ZERO,
            currency: Some("USD".to_string()),
            leverage: Some(100),
        };
        self.state()
            .accounts
            .insert(login, FakeAccount { password: password.to_string(), info, deals: Vec::new() });
    }

    pub fn set_equity(&self, login: AccountNumber, equity: Decimal) {
        if let Some(account) = self.state().accounts.get_mut(&login) {
            account.info.equity = equity;
        }
    }

    pub fn set_balance(&self, login: AccountNumber, balance: Decimal) {
        if let Some(account) = self.state().accounts.get_mut(&login) {
            account.info.balance = balance;
        }
    }

    pub fn push_deal(&self, login: AccountNumber, deal: DealRecord) {
        if let Some(account) = self.state().accounts.get_mut(&login) {
            account.deals.push(deal);
        }
    }

    /// Convenience for a balance operation with `profit = amount`
    pub fn push_balance(&self, login: AccountNumber, ticket: Ticket, time: DateTime<Utc>, amount: Decimal, comment: &str) {
        self.push_deal(
            login,
            DealRecord {
                ticket,
                time,
                kind: DealKind::Balance,
                symbol: None,
                volume: Decimal::ZERO,
                price: Decimal::ZERO,
                profit: amount,
                swap: Decimal::ZERO,
                commission: Decimal::ZERO,
                comment: comment.to_string(),
            },
        );
    }

    /// Make logins for `requested` land on `reported`
    pub fn impersonate(&self, requested: AccountNumber, reported: AccountNumber) {
        self.state().impersonations.insert(requested, reported);
    }

    pub fn clear_impersonation(&self, requested: AccountNumber) {
        self.state().impersonations.remove(&requested);
    }

    /// Switch the authenticated account behind the caller's back
    pub fn switch_to(&self, login: AccountNumber) {
        self.state().logged_in = Some(login);
    }

    /// Fail the next `times` logins for `login` as unreachable
    pub fn fail_logins(&self, login: AccountNumber, times: u32) {
        self.state().failing_logins.insert(login, times);
    }

    /// Never answer calls made for `login`
    pub fn hang_on(&self, login: AccountNumber) {
        self.state().hanging.insert(login);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn logged_in(&self) -> Option<AccountNumber> {
        self.state().logged_in
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn overlap_count(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    /// Number of `account_info` and `deal_history` calls served
    pub fn read_calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    async fn enter(&self, account: AccountNumber) -> Result<CallGuard<'_>> {
        let previous = self.active.fetch_add(1, Ordering::SeqCst);
        let guard = CallGuard { active: &self.active };
        self.max_active.fetch_max(previous + 1, Ordering::SeqCst);
        if previous > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
            return Err(TerminalError::Protocol(format!("overlapping use of terminal '{}'", self.server)));
        }

        let (hang, unreachable) = {
            let state = self.state();
            (state.hanging.contains(&account), state.unreachable)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if unreachable {
            return Err(TerminalError::Unreachable(format!("terminal '{}' is offline", self.server)));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(guard)
    }

    fn current_login(&self) -> Result<AccountNumber> {
        self.state()
            .logged_in
            .ok_or_else(|| TerminalError::Unreachable("no account logged in".to_string()))
    }
}

#[async_trait]
impl TerminalBridge for FakeTerminal {
    async fn health(&self) -> Result<HealthStatus> {
        let state = self.state();
        Ok(HealthStatus { connected: !state.unreachable, login: state.logged_in, server: Some(self.server.clone()) })
    }

    async fn login(&self, account: AccountNumber, credentials: &Credentials, server: &str) -> Result<LoginResponse> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        let _call = self.enter(account).await?;

        let mut state = self.state();
        if let Some(remaining) = state.failing_logins.get_mut(&account) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TerminalError::Unreachable("connection refused".to_string()));
            }
        }

        let target = state.impersonations.get(&account).copied().unwrap_or(account);
        match state.accounts.get(&account) {
            Some(known) if known.password == credentials.password() => {}
            _ => {
                return Err(TerminalError::AuthFailed { account, reason: "invalid account".to_string() });
            }
        }

        state.logged_in = Some(target);
        Ok(LoginResponse { login: target, server: server.to_string() })
    }

    async fn account_info(&self, account: AccountNumber) -> Result<AccountInfo> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let _call = self.enter(account).await?;
        let login = self.current_login()?;
        self.state()
            .accounts
            .get(&login)
            .map(|a| a.info.clone())
            .ok_or_else(|| TerminalError::Protocol(format!("no data for {login}")))
    }

    async fn deal_history(&self, account: AccountNumber, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<DealHistory> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let _call = self.enter(account).await?;
        let login = self.current_login()?;
        let state = self.state();
        let deals = state
            .accounts
            .get(&login)
            .map(|a| a.deals.iter().filter(|d| d.time >= from && d.time <= to).cloned().collect())
            .unwrap_or_default();
        Ok(DealHistory { login, deals })
    }
}
