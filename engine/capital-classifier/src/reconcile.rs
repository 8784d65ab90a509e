//! Allocation reconciliation
//!
//! Recomputes the verified qualifying deposits of every client and house account
//! from deal evidence and compares them with the stored allocations. Differences
//! are reported and never corrected here.

use chrono::{DateTime, Utc};
use ledger::{AccountNumber, CapitalSource, LedgerSnapshot};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

use crate::classifier::{CapitalClassifier, Decision};
use crate::rules::{RuleId, RULESET_VERSION};

/// Stored allocation that disagrees with the evidence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationMismatch {
    pub account_number: AccountNumber,
    pub stored_source: CapitalSource,
    pub derived_source: CapitalSource,
    pub stored_allocation: Decimal,
    pub verified_deposits: Decimal,
}

impl ReconciliationMismatch {
    pub fn difference(&self) -> Decimal {
        self.stored_allocation - self.verified_deposits
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub ruleset_version: &'static str,
    pub snapshot_taken_at: DateTime<Utc>,
    /// Stored client and house allocations, excluding manual assignments
    pub stored_total: Decimal,
    pub verified_total: Decimal,
    pub mismatches: Vec<ReconciliationMismatch>,
    /// Client accounts backed only by a roster assignment
    pub unverified_manual: Vec<AccountNumber>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && self.stored_total == self.verified_total
    }
}

fn counts_as_capital(source: CapitalSource) -> bool {
    matches!(source, CapitalSource::Client | CapitalSource::Fidus)
}

impl CapitalClassifier {
    pub fn reconcile(&self, snapshot: &LedgerSnapshot) -> ReconciliationReport {
        let mut report = ReconciliationReport {
            ruleset_version: RULESET_VERSION,
            snapshot_taken_at: snapshot.taken_at,
            stored_total: Decimal::ZERO,
            verified_total: Decimal::ZERO,
            mismatches: Vec::new(),
            unverified_manual: Vec::new(),
        };

        for account in snapshot.active_accounts() {
            let derived = self.classify(account, snapshot.deals_for(account.account_number));

            if derived.decision == (Decision::Matched { rule: RuleId::ManualClient }) {
                report.unverified_manual.push(account.account_number);
                continue;
            }

            let stored = if counts_as_capital(account.capital_source) { account.initial_allocation } else { Decimal::ZERO };
            let verified =
                if counts_as_capital(derived.capital_source) { derived.initial_allocation } else { Decimal::ZERO };

            report.stored_total += stored;
            report.verified_total += verified;

            let in_scope = counts_as_capital(account.capital_source) || counts_as_capital(derived.capital_source);
            if in_scope && (stored != verified || account.capital_source != derived.capital_source) {
                warn!(
                    account = account.account_number,
                    stored_source = %account.capital_source,
                    derived_source = %derived.capital_source,
                    %stored,
                    %verified,
                    "Allocation does not match deal evidence"
                );
                report.mismatches.push(ReconciliationMismatch {
                    account_number: account.account_number,
                    stored_source: account.capital_source,
                    derived_source: derived.capital_source,
                    stored_allocation: stored,
                    verified_deposits: verified,
                });
            }
        }

        report
    }
}
