//! The capital source rule table
//!
//! Rules are evaluated in priority order and the first match wins, except when two
//! mutually exclusive rules both match: the account is then left `unknown` and
//! reported as ambiguous. Any change to the table or the exclusions must bump
//! [`RULESET_VERSION`].

use ledger::{CapitalSource, ManagedAccount};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ClassifierConfig;
use crate::evidence::Evidence;

pub const RULESET_VERSION: &str = "2025.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    ClientDeposit,
    SeparationTransfer,
    SeparationMember,
    HouseMember,
    ManualClient,
    IntermediaryMember,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::ClientDeposit => "client_deposit",
            RuleId::SeparationTransfer => "separation_transfer",
            RuleId::SeparationMember => "separation_member",
            RuleId::HouseMember => "house_member",
            RuleId::ManualClient => "manual_client",
            RuleId::IntermediaryMember => "intermediary_member",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a rule may look at for one account
pub struct Facts<'a> {
    pub account: &'a ManagedAccount,
    pub evidence: &'a Evidence,
    pub config: &'a ClassifierConfig,
}

pub struct Rule {
    pub id: RuleId,
    pub source: CapitalSource,
    pub description: &'static str,
    pub matches: fn(&Facts<'_>) -> bool,
    pub allocation: fn(&Facts<'_>) -> Decimal,
}

fn client_deposit(facts: &Facts<'_>) -> bool {
    facts.evidence.has_client_deposit()
}

fn client_deposit_total(facts: &Facts<'_>) -> Decimal {
    facts.evidence.client_deposit_total
}

fn separation_transfer(facts: &Facts<'_>) -> bool {
    facts.evidence.has_separation_transfer()
}

fn separation_member(facts: &Facts<'_>) -> bool {
    facts.config.is_separation(facts.account.account_number)
}

fn house_member(facts: &Facts<'_>) -> bool {
    facts.config.is_house(facts.account.account_number)
}

fn external_deposit_total(facts: &Facts<'_>) -> Decimal {
    facts.evidence.external_deposit_total
}

fn manual_client(facts: &Facts<'_>) -> bool {
    facts.account.manual_client_allocation.is_some()
}

fn manual_allocation(facts: &Facts<'_>) -> Decimal {
    facts.account.manual_client_allocation.unwrap_or_default()
}

fn intermediary_member(facts: &Facts<'_>) -> bool {
    facts.config.is_intermediary(facts.account.account_number)
}

fn zero(_: &Facts<'_>) -> Decimal {
    Decimal::ZERO
}

/// Priority-ordered rule table; `unknown` is the implicit fallback
pub const RULES: &[Rule] = &[
    Rule {
        id: RuleId::ClientDeposit,
        source: CapitalSource::Client,
        description: "balance deal carries a client deposit marker",
        matches: client_deposit,
        allocation: client_deposit_total,
    },
    Rule {
        id: RuleId::SeparationTransfer,
        source: CapitalSource::ReinvestedProfit,
        description: "funded by a transfer from a separation account",
        matches: separation_transfer,
        allocation: zero,
    },
    Rule {
        id: RuleId::SeparationMember,
        source: CapitalSource::Separation,
        description: "configured separation account",
        matches: separation_member,
        allocation: zero,
    },
    Rule {
        id: RuleId::HouseMember,
        source: CapitalSource::Fidus,
        description: "configured house account",
        matches: house_member,
        allocation: external_deposit_total,
    },
    Rule {
        id: RuleId::ManualClient,
        source: CapitalSource::Client,
        description: "explicit client assignment in the roster",
        matches: manual_client,
        allocation: manual_allocation,
    },
    Rule {
        id: RuleId::IntermediaryMember,
        source: CapitalSource::Intermediary,
        description: "configured intermediary account",
        matches: intermediary_member,
        allocation: zero,
    },
];

/// Pairs of rules that must never both match one account
pub const EXCLUSIVE: &[(RuleId, RuleId)] = &[
    (RuleId::ClientDeposit, RuleId::SeparationTransfer),
    (RuleId::ClientDeposit, RuleId::SeparationMember),
    (RuleId::SeparationTransfer, RuleId::SeparationMember),
    (RuleId::SeparationMember, RuleId::HouseMember),
];

pub fn are_exclusive(a: RuleId, b: RuleId) -> bool {
    EXCLUSIVE.iter().any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
}

pub fn rule(id: RuleId) -> Option<&'static Rule> {
    RULES.iter().find(|r| r.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_table_order_is_fixed() {
        let order: Vec<RuleId> = RULES.iter().map(|r| r.id).collect();
        assert_eq!(
            order,
            vec![
                RuleId::ClientDeposit,
                RuleId::SeparationTransfer,
                RuleId::SeparationMember,
                RuleId::HouseMember,
                RuleId::ManualClient,
                RuleId::IntermediaryMember,
            ]
        );
    }

    #[test]
    fn test_exclusivity_is_symmetric() {
        assert!(are_exclusive(RuleId::ClientDeposit, RuleId::SeparationTransfer));
        assert!(are_exclusive(RuleId::SeparationTransfer, RuleId::ClientDeposit));
        assert!(are_exclusive(RuleId::HouseMember, RuleId::SeparationMember));
        assert!(!are_exclusive(RuleId::ClientDeposit, RuleId::HouseMember));
        assert!(!are_exclusive(RuleId::ManualClient, RuleId::IntermediaryMember));
    }
}
