//! Postgres-backed ledger

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::collections::HashMap;

use crate::config::DatabaseConfig;
use crate::error::{LedgerError, Result};
use crate::store::LedgerStore;
use crate::types::{
    AccountNumber, CapitalSource, ConnectionStatus, Deal, LedgerSnapshot, LiveFields, LiveUpdate,
    ManagedAccount, SyncCursor,
};

const ACCOUNT_COLUMNS: &str = "account_number, broker, server, fund_code, owner, capital_source, \
     initial_allocation, manual_client_allocation, balance, equity, margin, profit, currency, \
     leverage, last_sync_at, connection_status, status_reason, consecutive_failures, is_active";

const DEAL_COLUMNS: &str =
    "ticket, account_number, deal_time, kind, symbol, volume, price, profit, swap, commission, comment";

/// Ledger stored in Postgres
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Connect to the database and run embedded migrations
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await?;

        if config.run_migrations {
            sqlx::migrate!("./migrations").run(&pool).await?;
        }

        tracing::info!(max_connections = config.max_connections, "Postgres ledger connected");
        Ok(Self { pool })
    }

    /// Wrap an existing pool; migrations are the caller's responsibility
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn last_sync_at(&self, account_number: AccountNumber) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_sync_at FROM managed_accounts WHERE account_number = $1")
            .bind(account_number)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::AccountNotFound(account_number))?;
        Ok(row.try_get("last_sync_at")?)
    }

    async fn ensure_exists(&self, account_number: AccountNumber) -> Result<()> {
        self.last_sync_at(account_number).await.map(|_| ())
    }
}

fn account_from_row(row: &PgRow) -> Result<ManagedAccount> {
    let capital_source: String = row.try_get("capital_source")?;
    let connection_status: String = row.try_get("connection_status")?;
    let consecutive_failures: i32 = row.try_get("consecutive_failures")?;

    Ok(ManagedAccount {
        account_number: row.try_get("account_number")?,
        broker: row.try_get("broker")?,
        server: row.try_get("server")?,
        fund_code: row.try_get("fund_code")?,
        owner: row.try_get("owner")?,
        capital_source: capital_source.parse()?,
        initial_allocation: row.try_get("initial_allocation")?,
        manual_client_allocation: row.try_get("manual_client_allocation")?,
        balance: row.try_get("balance")?,
        equity: row.try_get("equity")?,
        margin: row.try_get("margin")?,
        profit: row.try_get("profit")?,
        currency: row.try_get("currency")?,
        leverage: row.try_get("leverage")?,
        last_sync_at: row.try_get("last_sync_at")?,
        connection_status: connection_status.parse()?,
        status_reason: row.try_get("status_reason")?,
        consecutive_failures: u32::try_from(consecutive_failures).unwrap_or(0),
        is_active: row.try_get("is_active")?,
    })
}

fn deal_from_row(row: &PgRow) -> Result<Deal> {
    let kind: String = row.try_get("kind")?;
    Ok(Deal {
        ticket: row.try_get("ticket")?,
        account_number: row.try_get("account_number")?,
        time: row.try_get("deal_time")?,
        kind: kind.parse()?,
        symbol: row.try_get("symbol")?,
        volume: row.try_get("volume")?,
        price: row.try_get("price")?,
        profit: row.try_get("profit")?,
        swap: row.try_get("swap")?,
        commission: row.try_get("commission")?,
        comment: row.try_get("comment")?,
    })
}

fn cursor_from_row(row: &PgRow) -> Result<(AccountNumber, SyncCursor)> {
    Ok((
        row.try_get("account_number")?,
        SyncCursor {
            last_ticket: row.try_get("last_ticket")?,
            last_deal_time: row.try_get("last_deal_time")?,
        },
    ))
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn register_account(&self, account: &ManagedAccount) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO managed_accounts
                (account_number, broker, server, fund_code, owner, manual_client_allocation, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (account_number)
            DO UPDATE SET
                broker = EXCLUDED.broker,
                server = EXCLUDED.server,
                fund_code = EXCLUDED.fund_code,
                owner = EXCLUDED.owner,
                manual_client_allocation = EXCLUDED.manual_client_allocation,
                is_active = EXCLUDED.is_active,
                updated_at = NOW()
            "#,
        )
        .bind(account.account_number)
        .bind(&account.broker)
        .bind(&account.server)
        .bind(&account.fund_code)
        .bind(&account.owner)
        .bind(account.manual_client_allocation)
        .bind(account.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_account(&self, account_number: AccountNumber) -> Result<()> {
        let result = sqlx::query(
            "UPDATE managed_accounts SET is_active = FALSE, updated_at = NOW() WHERE account_number = $1",
        )
        .bind(account_number)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(account_number));
        }
        Ok(())
    }

    async fn get_account(&self, account_number: AccountNumber) -> Result<Option<ManagedAccount>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM managed_accounts WHERE account_number = $1"
        ))
        .bind(account_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn list_accounts(&self, active_only: bool) -> Result<Vec<ManagedAccount>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM managed_accounts \
             WHERE is_active OR NOT $1 ORDER BY account_number"
        ))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn deals_for(&self, account_number: AccountNumber) -> Result<Vec<Deal>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEAL_COLUMNS} FROM deals WHERE account_number = $1 ORDER BY ticket"
        ))
        .bind(account_number)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deal_from_row).collect()
    }

    async fn cursor(&self, account_number: AccountNumber) -> Result<Option<SyncCursor>> {
        let row = sqlx::query(
            "SELECT account_number, last_ticket, last_deal_time FROM sync_cursors WHERE account_number = $1",
        )
        .bind(account_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(cursor_from_row).transpose()?.map(|(_, cursor)| cursor))
    }

    async fn append_deals(
        &self,
        account_number: AccountNumber,
        deals: &[Deal],
        cursor: Option<SyncCursor>,
    ) -> Result<usize> {
        if let Some(foreign) = deals.iter().find(|d| d.account_number != account_number) {
            return Err(LedgerError::ForeignDeal {
                expected: account_number,
                found: foreign.account_number,
                ticket: foreign.ticket,
            });
        }

        let mut tx = self.pool.begin().await?;

        let server: String =
            sqlx::query_scalar("SELECT server FROM managed_accounts WHERE account_number = $1")
                .bind(account_number)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(LedgerError::AccountNotFound(account_number))?;

        let tickets: Vec<i64> = deals.iter().map(|d| d.ticket).collect();
        let conflict = sqlx::query(
            "SELECT account_number, ticket FROM deals \
             WHERE server = $1 AND ticket = ANY($2) AND account_number <> $3 LIMIT 1",
        )
        .bind(&server)
        .bind(&tickets)
        .bind(account_number)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = conflict {
            return Err(LedgerError::TicketConflict {
                server,
                ticket: row.try_get("ticket")?,
                owner: row.try_get("account_number")?,
                attempted: account_number,
            });
        }

        let mut inserted = 0usize;
        for deal in deals {
            let result = sqlx::query(
                r#"
                INSERT INTO deals
                    (account_number, ticket, server, deal_time, kind, symbol, volume, price,
                     profit, swap, commission, comment)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (account_number, ticket) DO NOTHING
                "#,
            )
            .bind(account_number)
            .bind(deal.ticket)
            .bind(&server)
            .bind(deal.time)
            .bind(deal.kind.as_str())
            .bind(&deal.symbol)
            .bind(deal.volume)
            .bind(deal.price)
            .bind(deal.profit)
            .bind(deal.swap)
            .bind(deal.commission)
            .bind(&deal.comment)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }

        if let Some(cursor) = cursor {
            sqlx::query(
                r#"
                INSERT INTO sync_cursors (account_number, last_ticket, last_deal_time)
                VALUES ($1, $2, $3)
                ON CONFLICT (account_number)
                DO UPDATE SET
                    last_ticket = GREATEST(sync_cursors.last_ticket, EXCLUDED.last_ticket),
                    last_deal_time = GREATEST(sync_cursors.last_deal_time, EXCLUDED.last_deal_time),
                    updated_at = NOW()
                "#,
            )
            .bind(account_number)
            .bind(cursor.last_ticket)
            .bind(cursor.last_deal_time)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(account = account_number, inserted, offered = deals.len(), "Deals committed");
        Ok(inserted)
    }

    async fn update_live_fields(
        &self,
        account_number: AccountNumber,
        fields: &LiveFields,
    ) -> Result<LiveUpdate> {
        let result = sqlx::query(
            r#"
            UPDATE managed_accounts SET
                balance = $2,
                equity = $3,
                margin = $4,
                profit = $5,
                currency = $6,
                leverage = $7,
                last_sync_at = $8,
                connection_status = 'connected',
                status_reason = NULL,
                consecutive_failures = 0,
                updated_at = NOW()
            WHERE account_number = $1 AND (last_sync_at IS NULL OR last_sync_at <= $8)
            "#,
        )
        .bind(account_number)
        .bind(fields.balance)
        .bind(fields.equity)
        .bind(fields.margin)
        .bind(fields.profit)
        .bind(&fields.currency)
        .bind(fields.leverage)
        .bind(fields.as_of)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(LiveUpdate::Applied);
        }

        match self.last_sync_at(account_number).await? {
            Some(stored) => Ok(LiveUpdate::Stale { stored }),
            None => Err(LedgerError::invalid_data(format!(
                "live update for account {account_number} matched no row"
            ))),
        }
    }

    async fn record_failure(
        &self,
        account_number: AccountNumber,
        status: ConnectionStatus,
        reason: &str,
    ) -> Result<u32> {
        let failures: i32 = sqlx::query_scalar(
            r#"
            UPDATE managed_accounts SET
                connection_status = $2,
                status_reason = $3,
                consecutive_failures = consecutive_failures + 1,
                updated_at = NOW()
            WHERE account_number = $1
            RETURNING consecutive_failures
            "#,
        )
        .bind(account_number)
        .bind(status.as_str())
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(LedgerError::AccountNotFound(account_number))?;
        Ok(u32::try_from(failures).unwrap_or(0))
    }

    async fn set_classification(
        &self,
        account_number: AccountNumber,
        capital_source: CapitalSource,
        initial_allocation: Decimal,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE managed_accounts SET
                capital_source = $2,
                initial_allocation = $3,
                updated_at = NOW()
            WHERE account_number = $1
              AND (capital_source <> $2 OR initial_allocation <> $3)
            "#,
        )
        .bind(account_number)
        .bind(capital_source.as_str())
        .bind(initial_allocation)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.ensure_exists(account_number).await?;
        Ok(false)
    }

    async fn snapshot(&self) -> Result<LedgerSnapshot> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let taken_at: DateTime<Utc> = sqlx::query_scalar("SELECT NOW()").fetch_one(&mut *tx).await?;

        let accounts = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM managed_accounts ORDER BY account_number"
        ))
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(account_from_row)
        .collect::<Result<Vec<_>>>()?;

        let mut deals: HashMap<AccountNumber, Vec<Deal>> = HashMap::new();
        for row in sqlx::query(&format!("SELECT {DEAL_COLUMNS} FROM deals ORDER BY account_number, ticket"))
            .fetch_all(&mut *tx)
            .await?
        {
            let deal = deal_from_row(&row)?;
            deals.entry(deal.account_number).or_default().push(deal);
        }

        let cursors = sqlx::query("SELECT account_number, last_ticket, last_deal_time FROM sync_cursors")
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(cursor_from_row)
            .collect::<Result<HashMap<_, _>>>()?;

        tx.commit().await?;

        Ok(LedgerSnapshot { taken_at, accounts, deals, cursors })
    }
}
