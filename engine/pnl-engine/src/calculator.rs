//! Tiered P&L Calculator
//!
//! Every report is computed from exactly one [`LedgerSnapshot`]. Per account,
//! `true_pnl = (current_equity + profit_withdrawals) - initial_allocation`; tier
//! aggregates sum member accounts and recompute `return_percent` from the sums.
//! Inactive accounts are excluded everywhere.

use capital_classifier::CapitalClassifier;
use ledger::{AccountNumber, CapitalSource, LedgerSnapshot, LedgerStore, ManagedAccount};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{PnlError, Result};
use crate::types::{AccountPnl, PnlSnapshot, PnlTotals, TierReport, TierSummary};

pub struct PnlCalculator {
    classifier: Arc<CapitalClassifier>,
}

impl PnlCalculator {
    pub fn new(classifier: Arc<CapitalClassifier>) -> Self {
        Self { classifier }
    }

    fn pnl_of(&self, snapshot: &LedgerSnapshot, account: &ManagedAccount) -> AccountPnl {
        let withdrawals = self.classifier.profit_withdrawals(snapshot.deals_for(account.account_number));
        AccountPnl::new(
            account.account_number,
            account.capital_source,
            account.fund_code.clone(),
            account.owner.clone(),
            account.initial_allocation,
            account.equity,
            withdrawals,
        )
    }

    fn active_pnl<'a>(&'a self, snapshot: &'a LedgerSnapshot) -> impl Iterator<Item = AccountPnl> + 'a {
        snapshot.active_accounts().map(move |account| self.pnl_of(snapshot, account))
    }

    pub fn account_pnl(&self, snapshot: &LedgerSnapshot, account_number: AccountNumber) -> Result<AccountPnl> {
        let account = snapshot
            .account(account_number)
            .filter(|a| a.is_active)
            .ok_or(PnlError::AccountNotFound(account_number))?;
        Ok(self.pnl_of(snapshot, account))
    }

    pub fn accounts(&self, snapshot: &LedgerSnapshot) -> Vec<AccountPnl> {
        self.active_pnl(snapshot).collect()
    }

    pub fn compute_tier(&self, snapshot: &LedgerSnapshot, capital_source: CapitalSource, owner: Option<&str>) -> TierSummary {
        let members: Vec<AccountPnl> = self
            .active_pnl(snapshot)
            .filter(|p| p.capital_source == capital_source)
            .filter(|p| owner.map_or(true, |o| p.owner.as_deref() == Some(o)))
            .collect();

        TierSummary {
            capital_source,
            owner: owner.map(str::to_string),
            totals: members.iter().collect(),
            computed_at: snapshot.taken_at,
        }
    }

    pub fn compute_all_tiers(&self, snapshot: &LedgerSnapshot) -> TierReport {
        let mut client = PnlTotals::default();
        let mut fidus = PnlTotals::default();
        let mut reinvested = PnlTotals::default();
        let mut separation_balance = rust_decimal::Decimal::ZERO;

        for pnl in self.active_pnl(snapshot) {
            match pnl.capital_source {
                CapitalSource::Client => client.add(&pnl),
                CapitalSource::Fidus => fidus.add(&pnl),
                CapitalSource::ReinvestedProfit => reinvested.add(&pnl),
                CapitalSource::Separation => separation_balance += pnl.current_equity,
                CapitalSource::Intermediary | CapitalSource::Unknown => {}
            }
        }

        let mut total_fund = client.clone();
        total_fund.merge(&fidus);

        debug!(
            computed_at = %snapshot.taken_at,
            total_pnl = %total_fund.true_pnl,
            accounts = total_fund.account_count,
            "Tier report computed"
        );

        TierReport { computed_at: snapshot.taken_at, client, fidus, reinvested, total_fund, separation_balance }
    }

    /// One row per (tier, fund_code) with at least one active account
    pub fn compute_funds(&self, snapshot: &LedgerSnapshot) -> Vec<PnlSnapshot> {
        let mut groups: BTreeMap<(CapitalSource, String), PnlTotals> = BTreeMap::new();
        for pnl in self.active_pnl(snapshot) {
            groups.entry((pnl.capital_source, pnl.fund_code.clone())).or_default().add(&pnl);
        }
        groups
            .into_iter()
            .map(|((tier, fund_code), totals)| PnlSnapshot::from_totals(tier, fund_code, &totals, snapshot.taken_at))
            .collect()
    }

    /// Take one snapshot and compute every tier from it
    pub async fn tier_report(&self, store: &dyn LedgerStore) -> Result<TierReport> {
        let snapshot = store.snapshot().await?;
        Ok(self.compute_all_tiers(&snapshot))
    }
}
