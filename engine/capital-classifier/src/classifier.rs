//! Capital Source Classifier

use chrono::{DateTime, Utc};
use ledger::{AccountNumber, CapitalAllocation, CapitalSource, Deal, LedgerStore, ManagedAccount};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ClassifierConfig;
use crate::error::{ClassifierError, Result};
use crate::evidence::Evidence;
use crate::rules::{are_exclusive, Facts, RuleId, RULES, RULESET_VERSION};

/// How a classification was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Matched { rule: RuleId },
    /// Two mutually exclusive rules matched; the account is left unknown
    Ambiguous { first: RuleId, second: RuleId },
    Unmatched,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub account_number: AccountNumber,
    pub capital_source: CapitalSource,
    pub initial_allocation: Decimal,
    pub decision: Decision,
    pub profit_withdrawals: Decimal,
}

impl Classification {
    pub fn ambiguity(&self) -> Option<ClassifierError> {
        match self.decision {
            Decision::Ambiguous { first, second } => {
                Some(ClassifierError::ClassificationAmbiguous { account: self.account_number, first, second })
            }
            _ => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.capital_source == CapitalSource::Unknown
    }

    /// Why the account ended up unknown
    pub fn unknown_reason(&self) -> Option<String> {
        match self.decision {
            Decision::Ambiguous { .. } => self.ambiguity().map(|e| e.to_string()),
            Decision::Unmatched => Some("no rule matched the recorded evidence".to_string()),
            Decision::Matched { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownAccount {
    pub account_number: AccountNumber,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub ruleset_version: &'static str,
    pub classified_at: DateTime<Utc>,
    pub assignments: Vec<Classification>,
    /// Accounts whose stored tag or allocation was rewritten
    pub changed: usize,
    pub unknown: Vec<UnknownAccount>,
}

impl ClassificationReport {
    pub fn ambiguous(&self) -> impl Iterator<Item = &Classification> {
        self.assignments.iter().filter(|c| matches!(c.decision, Decision::Ambiguous { .. }))
    }
}

pub struct CapitalClassifier {
    config: ClassifierConfig,
}

impl CapitalClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn ruleset_version(&self) -> &'static str {
        RULESET_VERSION
    }

    /// Classify one account from its recorded deals
    pub fn classify(&self, account: &ManagedAccount, deals: &[Deal]) -> Classification {
        let evidence = Evidence::gather(deals, &self.config);
        let facts = Facts { account, evidence: &evidence, config: &self.config };

        let matched: Vec<_> = RULES.iter().filter(|rule| (rule.matches)(&facts)).collect();

        let conflict = matched.iter().enumerate().find_map(|(i, a)| {
            matched[i + 1..].iter().find(|b| are_exclusive(a.id, b.id)).map(|b| (a.id, b.id))
        });

        let (capital_source, initial_allocation, decision) = match (conflict, matched.first()) {
            (Some((first, second)), _) => (CapitalSource::Unknown, Decimal::ZERO, Decision::Ambiguous { first, second }),
            (None, Some(rule)) => (rule.source, (rule.allocation)(&facts), Decision::Matched { rule: rule.id }),
            (None, None) => (CapitalSource::Unknown, Decimal::ZERO, Decision::Unmatched),
        };

        Classification {
            account_number: account.account_number,
            capital_source,
            initial_allocation,
            decision,
            profit_withdrawals: evidence.profit_withdrawals,
        }
    }

    /// Sum of transfers out to separation accounts
    pub fn profit_withdrawals(&self, deals: &[Deal]) -> Decimal {
        Evidence::gather(deals, &self.config).profit_withdrawals
    }

    pub fn allocation_view(&self, account: &ManagedAccount, deals: &[Deal]) -> CapitalAllocation {
        let classification = self.classify(account, deals);
        CapitalAllocation {
            account_number: account.account_number,
            capital_source: classification.capital_source,
            initial_allocation: classification.initial_allocation,
            profit_withdrawals_total: classification.profit_withdrawals,
        }
    }

    /// Classify every active account from one snapshot and write the results
    ///
    /// Only the tag/allocation pair is written; running it twice changes nothing.
    pub async fn reclassify_all(&self, store: &dyn LedgerStore) -> Result<ClassificationReport> {
        let snapshot = store.snapshot().await?;

        let mut assignments = Vec::new();
        let mut unknown = Vec::new();
        let mut changed = 0;

        for account in snapshot.active_accounts() {
            let classification = self.classify(account, snapshot.deals_for(account.account_number));

            if let Some(ambiguity) = classification.ambiguity() {
                warn!(account = account.account_number, "{}", ambiguity);
            }
            if let Some(reason) = classification.unknown_reason() {
                unknown.push(UnknownAccount { account_number: account.account_number, reason });
            }

            if store
                .set_classification(
                    account.account_number,
                    classification.capital_source,
                    classification.initial_allocation,
                )
                .await?
            {
                info!(
                    account = account.account_number,
                    from = %account.capital_source,
                    to = %classification.capital_source,
                    allocation = %classification.initial_allocation,
                    "Capital source changed"
                );
                changed += 1;
            }
            assignments.push(classification);
        }

        info!(
            ruleset = RULESET_VERSION,
            accounts = assignments.len(),
            changed,
            unknown = unknown.len(),
            "Classification pass completed"
        );

        Ok(ClassificationReport {
            ruleset_version: RULESET_VERSION,
            classified_at: snapshot.taken_at,
            assignments,
            changed,
            unknown,
        })
    }
}
