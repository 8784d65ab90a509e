//! Static account roster
//!
//! The roster is the only source of managed accounts: it is loaded from TOML at
//! startup and upserted into the ledger. Accounts dropped from the roster are
//! deactivated, never deleted.

use anyhow::{anyhow, Context, Result};
use ledger::{AccountNumber, LedgerStore, ManagedAccount};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tracing::{info, warn};

use account_sync::EnvCredentials;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub account_number: AccountNumber,
    pub broker: String,
    pub server: String,
    pub fund_code: String,
    #[serde(default)]
    pub owner: Option<String>,
    /// Environment variable holding the terminal password
    #[serde(default)]
    pub password_env: Option<String>,
    /// Explicit client assignment, used when no deposit evidence exists
    #[serde(default)]
    pub manual_client_allocation: Option<Decimal>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl RosterEntry {
    pub fn to_account(&self) -> ManagedAccount {
        let mut account = ManagedAccount::new(self.account_number, &self.broker, &self.server, &self.fund_code);
        if let Some(owner) = &self.owner {
            account = account.with_owner(owner);
        }
        if let Some(allocation) = self.manual_client_allocation {
            account = account.with_manual_client_allocation(allocation);
        }
        account.is_active = self.active;
        account
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub accounts: Vec<RosterEntry>,
}

impl Roster {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read roster: {:?}", path))?;
        Self::parse(&contents).with_context(|| format!("Invalid roster: {:?}", path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let roster: Roster = toml::from_str(contents)?;
        roster.validate()?;
        Ok(roster)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.accounts {
            if !seen.insert(entry.account_number) {
                return Err(anyhow!("Account {} is listed twice", entry.account_number));
            }
            if entry.server.trim().is_empty() {
                return Err(anyhow!("Account {} has no server", entry.account_number));
            }
            if let Some(allocation) = entry.manual_client_allocation {
                if allocation.is_sign_negative() {
                    return Err(anyhow!("Account {} has a negative manual allocation", entry.account_number));
                }
            }
        }
        Ok(())
    }

    pub fn active(&self) -> impl Iterator<Item = &RosterEntry> {
        self.accounts.iter().filter(|e| e.active)
    }

    pub fn servers(&self) -> BTreeSet<&str> {
        self.active().map(|e| e.server.as_str()).collect()
    }

    /// Password lookup honouring each entry's `password_env`
    pub fn credentials(&self, prefix: &str) -> EnvCredentials {
        self.accounts
            .iter()
            .filter_map(|e| e.password_env.as_ref().map(|var| (e.account_number, var)))
            .fold(EnvCredentials::new(prefix), |creds, (account, var)| creds.with_var(account, var))
    }

    /// Servers with active accounts but no configured terminal
    pub fn unserved<'a>(&'a self, terminals: &[String]) -> Vec<&'a str> {
        self.servers().into_iter().filter(|s| !terminals.iter().any(|t| t == s)).collect()
    }

    /// Upsert every entry and deactivate stored accounts missing from the roster
    pub async fn seed(&self, store: &dyn LedgerStore) -> Result<SeedSummary> {
        let mut summary = SeedSummary::default();
        let listed: HashSet<AccountNumber> = self.accounts.iter().map(|e| e.account_number).collect();

        for entry in &self.accounts {
            store
                .register_account(&entry.to_account())
                .await
                .with_context(|| format!("Failed to register account {}", entry.account_number))?;
            summary.registered += 1;
        }

        for account in store.list_accounts(true).await? {
            if !listed.contains(&account.account_number) {
                warn!(account = account.account_number, "Account no longer in roster, deactivating");
                store.deactivate_account(account.account_number).await?;
                summary.deactivated += 1;
            }
        }

        info!(registered = summary.registered, deactivated = summary.deactivated, "Roster seeded");
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub registered: usize,
    pub deactivated: usize,
}
