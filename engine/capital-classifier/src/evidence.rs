//! Deal evidence extraction
//!
//! Everything the rule table looks at is derived here from an account's recorded
//! deals. Only balance operations count as evidence; trades never do.

use ledger::{AccountNumber, Deal};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::ClassifierConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    In,
    Out,
}

/// An internal transfer named in a deal comment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub direction: TransferDirection,
    pub counterparty: AccountNumber,
}

/// Parse comments such as `Transfer from #886528` or `internal transfer to 886528`
pub fn parse_transfer(comment: &str) -> Option<Transfer> {
    let lowered = comment.to_lowercase();
    let tokens: Vec<&str> = lowered.split_whitespace().collect();
    let start = tokens.iter().position(|t| t.contains("transfer"))?;

    let mut rest = tokens[start + 1..].iter();
    let direction = match rest.next().copied()? {
        "from" => TransferDirection::In,
        "to" => TransferDirection::Out,
        _ => return None,
    };
    let counterparty = rest
        .next()?
        .trim_start_matches('#')
        .trim_end_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()?;

    Some(Transfer { direction, counterparty })
}

/// Classification evidence found in one account's deals
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Evidence {
    /// Positive balance deals carrying a client deposit marker
    pub client_deposit_total: Decimal,
    pub client_deposit_count: usize,
    /// Separation accounts this account received transfers from
    pub separation_sources: Vec<AccountNumber>,
    /// Positive balance deals that are not internal transfers
    pub external_deposit_total: Decimal,
    /// Absolute value of transfers out to separation accounts
    pub profit_withdrawals: Decimal,
}

impl Evidence {
    pub fn gather(deals: &[Deal], config: &ClassifierConfig) -> Self {
        let mut evidence = Evidence::default();

        for deal in deals.iter().filter(|d| d.is_balance()) {
            let transfer = parse_transfer(&deal.comment);

            if deal.profit > Decimal::ZERO && config.has_client_marker(&deal.comment) {
                evidence.client_deposit_total += deal.profit;
                evidence.client_deposit_count += 1;
            }

            match transfer {
                Some(Transfer { direction: TransferDirection::In, counterparty })
                    if config.is_separation(counterparty) =>
                {
                    if !evidence.separation_sources.contains(&counterparty) {
                        evidence.separation_sources.push(counterparty);
                    }
                }
                Some(Transfer { direction: TransferDirection::Out, counterparty })
                    if config.is_separation(counterparty) =>
                {
                    evidence.profit_withdrawals += deal.profit.abs();
                }
                Some(_) => {}
                None if deal.profit > Decimal::ZERO => evidence.external_deposit_total += deal.profit,
                None => {}
            }
        }

        evidence
    }

    pub fn has_client_deposit(&self) -> bool {
        self.client_deposit_count > 0
    }

    pub fn has_separation_transfer(&self) -> bool {
        !self.separation_sources.is_empty()
    }
}
