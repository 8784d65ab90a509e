//! Account Snapshot Fetcher

use chrono::{DateTime, Utc};
use ledger::{AccountNumber, Deal, LiveFields, ManagedAccount, SyncCursor};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use terminal_broker::{DealRecord, TerminalBroker};
use tracing::debug;

use crate::config::FetcherConfig;
use crate::credentials::CredentialProvider;
use crate::error::FetchError;

/// Normalized read of one account at `taken_at`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSnapshot {
    pub account_number: AccountNumber,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub profit: Decimal,
    pub currency: Option<String>,
    pub leverage: Option<i32>,
    /// Deals after the cursor, ordered by ticket
    pub deals: Vec<Deal>,
    pub taken_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn live_fields(&self) -> LiveFields {
        LiveFields {
            balance: self.balance,
            equity: self.equity,
            margin: self.margin,
            profit: self.profit,
            currency: self.currency.clone(),
            leverage: self.leverage,
            as_of: self.taken_at,
        }
    }
}

/// Logs into one account through the broker and reads its state and new deals
///
/// Never writes to the ledger.
pub struct SnapshotFetcher {
    broker: Arc<TerminalBroker>,
    credentials: Arc<dyn CredentialProvider>,
    config: FetcherConfig,
}

impl SnapshotFetcher {
    pub fn new(broker: Arc<TerminalBroker>, credentials: Arc<dyn CredentialProvider>, config: FetcherConfig) -> Self {
        Self { broker, credentials, config }
    }

    pub fn broker(&self) -> &Arc<TerminalBroker> {
        &self.broker
    }

    /// Start of the history window for an account with `cursor`
    pub fn history_from(&self, cursor: Option<SyncCursor>, now: DateTime<Utc>) -> DateTime<Utc> {
        match cursor {
            Some(cursor) => cursor.last_deal_time,
            None => now - self.config.initial_lookback(),
        }
    }

    pub async fn fetch(
        &self,
        account: &ManagedAccount,
        cursor: Option<SyncCursor>,
    ) -> Result<AccountSnapshot, FetchError> {
        let credentials = self.credentials.credentials(account)?;
        let account_number = account.account_number;
        let from = self.history_from(cursor, Utc::now());
        let retry = &self.config.read_retry;

        let (info, taken_at, history) = self
            .broker
            .with_account(&account.server, account_number, &credentials, |session| async move {
                let session = &session;
                let info = retry.run("account_info", move || session.account_info()).await?;
                let taken_at = Utc::now();
                // Window must reach past the equity read so every operation it reflects is a deal
                let to = Utc::now();
                let history = retry.run("deal_history", move || session.deal_history(from, to)).await?;
                Ok((info, taken_at, history))
            })
            .await?;

        let deals = normalize_deals(account_number, history.deals, cursor);
        debug!(
            account = account_number,
            server = %account.server,
            new_deals = deals.len(),
            %from,
            "Snapshot fetched"
        );

        Ok(AccountSnapshot {
            account_number,
            balance: info.balance,
            equity: info.equity,
            margin: info.margin,
            profit: info.profit,
            currency: info.currency,
            leverage: info.leverage,
            deals,
            taken_at,
        })
    }
}

/// Convert bridge records to ledger deals, dropping anything at or below the cursor
/// and duplicate tickets within the response
fn normalize_deals(account_number: AccountNumber, records: Vec<DealRecord>, cursor: Option<SyncCursor>) -> Vec<Deal> {
    let floor = cursor.map(|c| c.last_ticket);
    let mut by_ticket = BTreeMap::new();
    for record in records {
        if floor.is_some_and(|last| record.ticket <= last) {
            continue;
        }
        by_ticket.entry(record.ticket).or_insert(Deal {
            ticket: record.ticket,
            account_number,
            time: record.time,
            kind: record.kind,
            symbol: record.symbol,
            volume: record.volume,
            price: record.price,
            profit: record.profit,
            swap: record.swap,
            commission: record.commission,
            comment: record.comment,
        });
    }
    by_ticket.into_values().collect()
}
