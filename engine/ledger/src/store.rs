//! Ledger store port

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::types::{
    AccountNumber, CapitalSource, ConnectionStatus, Deal, LedgerSnapshot, LiveFields, LiveUpdate,
    ManagedAccount, SyncCursor,
};

/// Persistent store for managed accounts and their deals
///
/// Writers are split by concern: the roster loader registers and deactivates accounts,
/// the sync orchestrator appends deals and writes live fields, and the capital
/// classifier writes only the tag/allocation pair. Readers that aggregate across
/// accounts must go through [`LedgerStore::snapshot`].
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a roster account, or refresh its static fields if it already exists.
    /// Live and classification fields of an existing account are left untouched.
    async fn register_account(&self, account: &ManagedAccount) -> Result<()>;

    /// Mark an account inactive; accounts are never deleted
    async fn deactivate_account(&self, account_number: AccountNumber) -> Result<()>;

    async fn get_account(&self, account_number: AccountNumber) -> Result<Option<ManagedAccount>>;

    async fn list_accounts(&self, active_only: bool) -> Result<Vec<ManagedAccount>>;

    /// Deals of one account ordered by ticket
    async fn deals_for(&self, account_number: AccountNumber) -> Result<Vec<Deal>>;

    async fn cursor(&self, account_number: AccountNumber) -> Result<Option<SyncCursor>>;

    /// Append deals keyed by `(account_number, ticket)` and advance the cursor in one
    /// atomic write. Already-recorded tickets are skipped. Returns the number of new deals.
    async fn append_deals(
        &self,
        account_number: AccountNumber,
        deals: &[Deal],
        cursor: Option<SyncCursor>,
    ) -> Result<usize>;

    /// Write live fields unless the stored `last_sync_at` is newer than `fields.as_of`.
    /// A successful write marks the account connected and clears its failure streak.
    async fn update_live_fields(
        &self,
        account_number: AccountNumber,
        fields: &LiveFields,
    ) -> Result<LiveUpdate>;

    /// Mark an account degraded, leaving its live fields untouched.
    /// Returns the new consecutive failure count.
    async fn record_failure(
        &self,
        account_number: AccountNumber,
        status: ConnectionStatus,
        reason: &str,
    ) -> Result<u32>;

    /// Write the classification pair. Returns whether anything changed.
    async fn set_classification(
        &self,
        account_number: AccountNumber,
        capital_source: CapitalSource,
        initial_allocation: Decimal,
    ) -> Result<bool>;

    /// Consistent point-in-time read of every account, deal and cursor
    async fn snapshot(&self) -> Result<LedgerSnapshot>;
}
