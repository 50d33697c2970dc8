// Persistence gateway
pub mod sqlite;

pub use sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::execution::Position;
use crate::models::{AccountSnapshot, BalanceAdjustment};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Durable row store for positions and balance history
///
/// Closed position rows are immutable: `upsert_position` returns `false`
/// when the stored row is already closed and nothing was written.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Atomic single-row upsert
    async fn upsert_position(&self, position: &Position) -> Result<bool, StoreError>;

    async fn load_position(&self, id: Uuid) -> Result<Option<Position>, StoreError>;

    /// Every position, oldest first
    async fn load_positions(&self) -> Result<Vec<Position>, StoreError>;

    async fn load_open_positions(&self) -> Result<Vec<Position>, StoreError>;

    /// Positions closed on `date` (UTC), ordered by close time
    async fn closed_positions_on(&self, date: NaiveDate) -> Result<Vec<Position>, StoreError>;

    /// The one definition of "today's PnL": realized PnL of positions closed on `date` (UTC)
    async fn daily_realized_pnl(&self, date: NaiveDate) -> Result<f64, StoreError>;

    async fn total_realized_pnl(&self) -> Result<f64, StoreError>;

    /// Record the adjustment that moves the balance to `target`
    ///
    /// The current balance (`base_balance` + adjustments + realized PnL) is read
    /// and the adjustment written atomically, so a close committed by another
    /// process cannot slip in between.
    async fn record_balance_reset(
        &self,
        base_balance: f64,
        target: f64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<BalanceAdjustment, StoreError>;

    async fn total_adjustments(&self) -> Result<f64, StoreError>;

    async fn save_account_snapshot(&self, snapshot: &AccountSnapshot) -> Result<(), StoreError>;

    /// Delete positions closed before `date`, folding their realized PnL into
    /// a balance adjustment in the same transaction. Returns rows removed.
    async fn purge_closed_before(&self, date: NaiveDate, reason: &str) -> Result<u64, StoreError>;
}
