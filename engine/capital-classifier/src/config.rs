//! Classifier configuration

use ledger::AccountNumber;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Account sets and comment markers the rule table matches against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Case-insensitive substrings marking a balance deal as a client deposit
    pub client_deposit_markers: Vec<String>,
    /// Accounts that receive profit sweeps
    pub separation_accounts: BTreeSet<AccountNumber>,
    /// Accounts funded by the house
    pub house_accounts: BTreeSet<AccountNumber>,
    pub intermediary_accounts: BTreeSet<AccountNumber>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            client_deposit_markers: vec!["client deposit".to_string(), "client funding".to_string()],
            separation_accounts: BTreeSet::new(),
            house_accounts: BTreeSet::new(),
            intermediary_accounts: BTreeSet::new(),
        }
    }
}

impl ClassifierConfig {
    pub fn is_separation(&self, account: AccountNumber) -> bool {
        self.separation_accounts.contains(&account)
    }

    pub fn is_house(&self, account: AccountNumber) -> bool {
        self.house_accounts.contains(&account)
    }

    pub fn is_intermediary(&self, account: AccountNumber) -> bool {
        self.intermediary_accounts.contains(&account)
    }

    pub fn has_client_marker(&self, comment: &str) -> bool {
        let comment = comment.to_lowercase();
        self.client_deposit_markers
            .iter()
            .any(|marker| !marker.is_empty() && comment.contains(&marker.to_lowercase()))
    }
}
