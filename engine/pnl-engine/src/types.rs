//! Type definitions for P&L reports

use chrono::{DateTime, Utc};
use ledger::{AccountNumber, CapitalSource};
use rust_decimal::Decimal;
use serde::Serialize;

/// `true_pnl / initial_allocation * 100`, zero when nothing was allocated
pub fn return_percent(true_pnl: Decimal, initial_allocation: Decimal) -> Decimal {
    if initial_allocation.is_zero() {
        Decimal::ZERO
    } else {
        true_pnl / initial_allocation * Decimal::ONE_HUNDRED
    }
}

/// P&L of one account
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountPnl {
    pub account_number: AccountNumber,
    pub capital_source: CapitalSource,
    pub fund_code: String,
    pub owner: Option<String>,
    pub initial_allocation: Decimal,
    pub current_equity: Decimal,
    pub profit_withdrawals: Decimal,
    pub true_pnl: Decimal,
    pub return_percent: Decimal,
}

impl AccountPnl {
    pub fn new(
        account_number: AccountNumber,
        capital_source: CapitalSource,
        fund_code: String,
        owner: Option<String>,
        initial_allocation: Decimal,
        current_equity: Decimal,
        profit_withdrawals: Decimal,
    ) -> Self {
        let true_pnl = (current_equity + profit_withdrawals) - initial_allocation;
        Self {
            account_number,
            capital_source,
            fund_code,
            owner,
            initial_allocation,
            current_equity,
            profit_withdrawals,
            true_pnl,
            return_percent: return_percent(true_pnl, initial_allocation),
        }
    }
}

/// Summed P&L over a set of accounts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PnlTotals {
    pub initial_allocation: Decimal,
    pub current_equity: Decimal,
    pub profit_withdrawals: Decimal,
    pub true_pnl: Decimal,
    /// Recomputed from the sums, never averaged
    pub return_percent: Decimal,
    pub account_count: usize,
}

impl PnlTotals {
    pub fn add(&mut self, account: &AccountPnl) {
        self.initial_allocation += account.initial_allocation;
        self.current_equity += account.current_equity;
        self.profit_withdrawals += account.profit_withdrawals;
        self.true_pnl += account.true_pnl;
        self.account_count += 1;
        self.return_percent = return_percent(self.true_pnl, self.initial_allocation);
    }

    pub fn merge(&mut self, other: &PnlTotals) {
        self.initial_allocation += other.initial_allocation;
        self.current_equity += other.current_equity;
        self.profit_withdrawals += other.profit_withdrawals;
        self.true_pnl += other.true_pnl;
        self.account_count += other.account_count;
        self.return_percent = return_percent(self.true_pnl, self.initial_allocation);
    }
}

impl<'a> FromIterator<&'a AccountPnl> for PnlTotals {
    fn from_iter<I: IntoIterator<Item = &'a AccountPnl>>(iter: I) -> Self {
        let mut totals = PnlTotals::default();
        for account in iter {
            totals.add(account);
        }
        totals
    }
}

/// P&L of one tier, optionally narrowed to one owner
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierSummary {
    pub capital_source: CapitalSource,
    pub owner: Option<String>,
    #[serde(flatten)]
    pub totals: PnlTotals,
    pub computed_at: DateTime<Utc>,
}

/// All tiers computed from one snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierReport {
    pub computed_at: DateTime<Utc>,
    pub client: PnlTotals,
    pub fidus: PnlTotals,
    pub reinvested: PnlTotals,
    /// Client plus fidus only
    pub total_fund: PnlTotals,
    /// Current equity held in separation accounts
    pub separation_balance: Decimal,
}

/// P&L of one (tier, fund) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PnlSnapshot {
    pub tier: CapitalSource,
    pub fund_code: String,
    pub initial_allocation: Decimal,
    pub current_equity: Decimal,
    pub profit_withdrawals: Decimal,
    pub true_pnl: Decimal,
    pub return_percent: Decimal,
    pub account_count: usize,
    pub computed_at: DateTime<Utc>,
}

impl PnlSnapshot {
    pub fn from_totals(tier: CapitalSource, fund_code: String, totals: &PnlTotals, computed_at: DateTime<Utc>) -> Self {
        Self {
            tier,
            fund_code,
            initial_allocation: totals.initial_allocation,
            current_equity: totals.current_equity,
            profit_withdrawals: totals.profit_withdrawals,
            true_pnl: totals.true_pnl,
            return_percent: totals.return_percent,
            account_count: totals.account_count,
            computed_at,
        }
    }
}
