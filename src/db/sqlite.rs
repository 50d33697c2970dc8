use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use super::{PositionStore, StoreError};
use crate::execution::{CloseReason, Position, PositionStatus};
use crate::models::{AccountSnapshot, BalanceAdjustment, Direction};

const POSITION_COLUMNS: &str = "id, signal_id, symbol, direction, entry_price, stop_price, \
     target_price, size, risk_amount, opened_at, status, close_reason, time_exit_kind, \
     exit_price, closed_at, realized_pnl, unrealized_pnl, current_price";

/// SQLite persistence for positions, adjustments and snapshots
pub struct SqlitePersistence {
    pool: SqlitePool,
}

fn day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

impl SqlitePersistence {
    /// Connect and run migrations
    ///
    /// # Arguments
    /// * `database_url` - e.g. "sqlite://paperbot.db" or "sqlite::memory:"
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // An in-memory database lives and dies with its single connection
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None::<std::time::Duration>)
            .max_lifetime(None::<std::time::Duration>)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to SQLite at {}", database_url);

        Ok(Self { pool })
    }

    /// Fresh private in-memory database
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::new("sqlite::memory:").await
    }

    /// Every balance adjustment, oldest first
    pub async fn load_adjustments(&self) -> Result<Vec<BalanceAdjustment>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, amount, reason, created_at
            FROM balance_adjustments
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut adjustments = Vec::with_capacity(rows.len());
        for row in rows {
            adjustments.push(BalanceAdjustment {
                id: row.try_get("id")?,
                amount: row.try_get("amount")?,
                reason: row.try_get("reason")?,
                created_at: row.try_get("created_at")?,
            });
        }

        Ok(adjustments)
    }

    /// Most recent snapshots, newest first
    pub async fn load_account_snapshots(
        &self,
        limit: i64,
    ) -> Result<Vec<AccountSnapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT taken_at, starting_balance, balance, realized_pnl, open_positions
            FROM account_snapshots
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            snapshots.push(AccountSnapshot {
                taken_at: row.try_get("taken_at")?,
                starting_balance: row.try_get("starting_balance")?,
                balance: row.try_get("balance")?,
                realized_pnl: row.try_get("realized_pnl")?,
                open_positions: row.try_get("open_positions")?,
            });
        }

        Ok(snapshots)
    }

    async fn fetch_positions(
        &self,
        sql: &str,
        day: Option<String>,
    ) -> Result<Vec<Position>, StoreError> {
        let mut query = sqlx::query(sql);
        if let Some(day) = day {
            query = query.bind(day);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(position_from_row).collect()
    }
}

fn position_from_row(row: &SqliteRow) -> Result<Position, StoreError> {
    let direction_str: String = row.try_get("direction")?;
    let direction = direction_str
        .parse::<Direction>()
        .map_err(StoreError::Corrupt)?;

    let status_str: String = row.try_get("status")?;
    let status = PositionStatus::parse(&status_str)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid position status '{}'", status_str)))?;

    let reason_str: Option<String> = row.try_get("close_reason")?;
    let kind_str: Option<String> = row.try_get("time_exit_kind")?;
    let close_reason = match reason_str {
        Some(reason) => Some(
            CloseReason::parse(&reason, kind_str.as_deref())
                .ok_or_else(|| StoreError::Corrupt(format!("invalid close reason '{}'", reason)))?,
        ),
        None => None,
    };

    Ok(Position {
        id: row.try_get("id")?,
        signal_id: row.try_get("signal_id")?,
        symbol: row.try_get("symbol")?,
        direction,
        entry_price: row.try_get("entry_price")?,
        stop_price: row.try_get("stop_price")?,
        target_price: row.try_get("target_price")?,
        size: row.try_get("size")?,
        risk_amount: row.try_get("risk_amount")?,
        opened_at: row.try_get("opened_at")?,
        status,
        close_reason,
        exit_price: row.try_get("exit_price")?,
        closed_at: row.try_get("closed_at")?,
        realized_pnl: row.try_get("realized_pnl")?,
        unrealized_pnl: row.try_get("unrealized_pnl")?,
        current_price: row.try_get("current_price")?,
    })
}

#[async_trait]
impl PositionStore for SqlitePersistence {
    async fn upsert_position(&self, position: &Position) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO positions (
                id, signal_id, symbol, direction, entry_price, stop_price,
                target_price, size, risk_amount, opened_at, status, close_reason,
                time_exit_kind, exit_price, closed_at, closed_on, realized_pnl,
                unrealized_pnl, current_price
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                close_reason = excluded.close_reason,
                time_exit_kind = excluded.time_exit_kind,
                exit_price = excluded.exit_price,
                closed_at = excluded.closed_at,
                closed_on = excluded.closed_on,
                realized_pnl = excluded.realized_pnl,
                unrealized_pnl = excluded.unrealized_pnl,
                current_price = excluded.current_price,
                updated_at = CURRENT_TIMESTAMP
            WHERE positions.status = 'Open'
            "#,
        )
        .bind(position.id)
        .bind(position.signal_id)
        .bind(&position.symbol)
        .bind(position.direction.as_str())
        .bind(position.entry_price)
        .bind(position.stop_price)
        .bind(position.target_price)
        .bind(position.size)
        .bind(position.risk_amount)
        .bind(position.opened_at)
        .bind(position.status.as_str())
        .bind(position.close_reason.map(|r| r.as_str()))
        .bind(
            position
                .close_reason
                .and_then(|r| r.time_exit_kind())
                .map(|k| k.as_str()),
        )
        .bind(position.exit_price)
        .bind(position.closed_at)
        .bind(position.closed_at.map(|t| day_key(t.date_naive())))
        .bind(position.realized_pnl)
        .bind(position.unrealized_pnl)
        .bind(position.current_price)
        .execute(&self.pool)
        .await?;

        let written = result.rows_affected() > 0;

        tracing::debug!(
            "Upserted position {} for {} ({}, written: {})",
            position.id,
            position.symbol,
            position.status.as_str(),
            written
        );

        Ok(written)
    }

    async fn load_position(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        let sql = format!("SELECT {} FROM positions WHERE id = ?", POSITION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(position_from_row).transpose()
    }

    async fn load_positions(&self) -> Result<Vec<Position>, StoreError> {
        let sql = format!(
            "SELECT {} FROM positions ORDER BY opened_at ASC",
            POSITION_COLUMNS
        );
        let positions = self.fetch_positions(&sql, None).await?;

        tracing::info!("Loaded {} positions from SQLite", positions.len());

        Ok(positions)
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let sql = format!(
            "SELECT {} FROM positions WHERE status = 'Open' ORDER BY opened_at ASC",
            POSITION_COLUMNS
        );
        self.fetch_positions(&sql, None).await
    }

    async fn closed_positions_on(&self, date: NaiveDate) -> Result<Vec<Position>, StoreError> {
        let sql = format!(
            "SELECT {} FROM positions WHERE status = 'Closed' AND closed_on = ? \
             ORDER BY closed_at ASC",
            POSITION_COLUMNS
        );
        self.fetch_positions(&sql, Some(day_key(date))).await
    }

    async fn daily_realized_pnl(&self, date: NaiveDate) -> Result<f64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(realized_pnl), 0.0) AS total_pnl
            FROM positions
            WHERE status = 'Closed' AND closed_on = ?
            "#,
        )
        .bind(day_key(date))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("total_pnl")?)
    }

    async fn total_realized_pnl(&self) -> Result<f64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(realized_pnl), 0.0) AS total_pnl
            FROM positions
            WHERE status = 'Closed'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("total_pnl")?)
    }

    async fn record_balance_reset(
        &self,
        base_balance: f64,
        target: f64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<BalanceAdjustment, StoreError> {
        let id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        // One statement: the balance it reads is the balance it adjusts
        let row = sqlx::query(
            r#"
            INSERT INTO balance_adjustments (id, amount, reason, created_at)
            SELECT ?, ? - (
                ?
                + (SELECT COALESCE(SUM(amount), 0.0) FROM balance_adjustments)
                + (SELECT COALESCE(SUM(realized_pnl), 0.0) FROM positions WHERE status = 'Closed')
            ), ?, ?
            RETURNING amount
            "#,
        )
        .bind(id)
        .bind(target)
        .bind(base_balance)
        .bind(reason)
        .bind(at)
        .fetch_one(&mut *tx)
        .await?;

        let amount: f64 = row.try_get("amount")?;
        tx.commit().await?;

        tracing::info!("Recorded balance adjustment {:+.2} ({})", amount, reason);

        Ok(BalanceAdjustment {
            id,
            amount,
            reason: reason.to_string(),
            created_at: at,
        })
    }

    async fn total_adjustments(&self) -> Result<f64, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(amount), 0.0) AS total_amount FROM balance_adjustments",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("total_amount")?)
    }

    async fn save_account_snapshot(&self, snapshot: &AccountSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO account_snapshots (
                taken_at, starting_balance, balance, realized_pnl, open_positions
            )
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.taken_at)
        .bind(snapshot.starting_balance)
        .bind(snapshot.balance)
        .bind(snapshot.realized_pnl)
        .bind(snapshot.open_positions)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_closed_before(&self, date: NaiveDate, reason: &str) -> Result<u64, StoreError> {
        let cutoff = day_key(date);
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS purged, COALESCE(SUM(realized_pnl), 0.0) AS realized
            FROM positions
            WHERE status = 'Closed' AND closed_on < ?
            "#,
        )
        .bind(&cutoff)
        .fetch_one(&mut *tx)
        .await?;

        let purged: i64 = row.try_get("purged")?;
        let realized: f64 = row.try_get("realized")?;

        if purged == 0 {
            return Ok(0);
        }

        sqlx::query("DELETE FROM positions WHERE status = 'Closed' AND closed_on < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;

        // Fold the purged PnL into the starting balance so the balance is unchanged
        let adjustment = BalanceAdjustment::new(
            realized,
            format!("{} (purged {} positions closed before {})", reason, purged, cutoff),
            Utc::now(),
        );

        sqlx::query(
            r#"
            INSERT INTO balance_adjustments (id, amount, reason, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(adjustment.id)
        .bind(adjustment.amount)
        .bind(&adjustment.reason)
        .bind(adjustment.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::warn!(
            "Purged {} closed positions before {} (realized {:+.2} folded into starting balance)",
            purged,
            cutoff,
            realized
        );

        Ok(purged as u64)
    }
}
