//! Account credential lookup

use ledger::{AccountNumber, ManagedAccount};
use std::collections::HashMap;
use terminal_broker::Credentials;

use crate::error::FetchError;

/// Supplies the terminal password of a managed account
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, account: &ManagedAccount) -> Result<Credentials, FetchError>;
}

/// Reads passwords from environment variables at lookup time
///
/// Accounts without an explicit variable fall back to `{prefix}{account_number}`.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    prefix: String,
    vars: HashMap<AccountNumber, String>,
}

impl EnvCredentials {
    pub const DEFAULT_PREFIX: &'static str = "FUND_SYNC_PASSWORD_";

    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), vars: HashMap::new() }
    }

    pub fn with_var(mut self, account: AccountNumber, var: impl Into<String>) -> Self {
        self.vars.insert(account, var.into());
        self
    }

    pub fn var_for(&self, account: AccountNumber) -> String {
        self.vars.get(&account).cloned().unwrap_or_else(|| format!("{}{}", self.prefix, account))
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PREFIX)
    }
}

impl CredentialProvider for EnvCredentials {
    fn credentials(&self, account: &ManagedAccount) -> Result<Credentials, FetchError> {
        let var = self.var_for(account.account_number);
        match std::env::var(&var) {
            Ok(password) if !password.is_empty() => Ok(Credentials::new(password)),
            _ => Err(FetchError::MissingCredentials {
                account: account.account_number,
                reason: format!("environment variable {var} is not set"),
            }),
        }
    }
}

/// Fixed credentials, for tests and dry runs
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    passwords: HashMap<AccountNumber, Credentials>,
    fallback: Option<Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the same password for every account
    pub fn shared(password: impl Into<String>) -> Self {
        Self { passwords: HashMap::new(), fallback: Some(Credentials::new(password)) }
    }

    pub fn with(mut self, account: AccountNumber, password: impl Into<String>) -> Self {
        self.passwords.insert(account, Credentials::new(password));
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self, account: &ManagedAccount) -> Result<Credentials, FetchError> {
        self.passwords
            .get(&account.account_number)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| FetchError::MissingCredentials {
                account: account.account_number,
                reason: "no static password configured".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_name_falls_back_to_prefix() {
        let provider = EnvCredentials::default().with_var(885822, "CORE_885822_PW");
        assert_eq!(provider.var_for(885822), "CORE_885822_PW");
        assert_eq!(provider.var_for(886557), "FUND_SYNC_PASSWORD_886557");
    }

    #[test]
    fn test_missing_env_var_is_reported() {
        let provider = EnvCredentials::new("FUND_SYNC_TEST_UNSET_");
        let account = ManagedAccount::new(424242, "MEXAtlantic", "MEXAtlantic-Real", "CORE");
        assert!(matches!(
            provider.credentials(&account),
            Err(FetchError::MissingCredentials { account: 424242, .. })
        ));
    }

    #[test]
    fn test_static_credentials_prefer_account_entry() {
        let provider = StaticCredentials::shared("shared").with(1, "own");
        let own = ManagedAccount::new(1, "b", "s", "CORE");
        let other = ManagedAccount::new(2, "b", "s", "CORE");
        assert_eq!(provider.credentials(&own).unwrap().password(), "own");
        assert_eq!(provider.credentials(&other).unwrap().password(), "shared");
        assert!(StaticCredentials::new().credentials(&own).is_err());
    }
}
