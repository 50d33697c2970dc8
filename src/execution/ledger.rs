use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::db::PositionStore;
use crate::error::{ensure_price, TradingError, TradingResult};
use crate::execution::{CloseReason, PnlAccountant, Position, RetryPolicy};
use crate::models::Signal;
use crate::risk::PositionSizing;

/// Result of a close request
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// This call performed the transition
    Closed(Position),
    /// Someone else closed it first; the stored record is returned unchanged
    AlreadyClosed(Position),
}

impl CloseOutcome {
    pub fn position(&self) -> &Position {
        match self {
            CloseOutcome::Closed(p) | CloseOutcome::AlreadyClosed(p) => p,
        }
    }

    pub fn into_position(self) -> Position {
        match self {
            CloseOutcome::Closed(p) | CloseOutcome::AlreadyClosed(p) => p,
        }
    }

    pub fn was_closed_here(&self) -> bool {
        matches!(self, CloseOutcome::Closed(_))
    }
}

/// Sole owner of position state
///
/// Every open and close is persisted before it becomes visible in memory.
/// Mutations for one symbol are serialized by that symbol's lock; the
/// lock is always taken before the position map.
pub struct PositionLedger {
    positions: RwLock<HashMap<Uuid, Position>>,
    symbol_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    dirty_marks: Mutex<HashSet<Uuid>>,
    store: Arc<dyn PositionStore>,
    accountant: PnlAccountant,
    retry: RetryPolicy,
}

impl PositionLedger {
    pub fn new(store: Arc<dyn PositionStore>, accountant: PnlAccountant, retry: RetryPolicy) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            symbol_locks: Mutex::new(HashMap::new()),
            dirty_marks: Mutex::new(HashSet::new()),
            store,
            accountant,
            retry,
        }
    }

    /// Rebuild the ledger from persisted rows
    pub async fn restore(
        store: Arc<dyn PositionStore>,
        accountant: PnlAccountant,
        retry: RetryPolicy,
    ) -> TradingResult<Self> {
        let loaded = {
            let store = store.as_ref();
            retry.run("load positions", || store.load_positions()).await?
        };

        let open_count = loaded.iter().filter(|p| p.is_open()).count();
        let positions: HashMap<Uuid, Position> = loaded.into_iter().map(|p| (p.id, p)).collect();

        tracing::info!(
            "Restored {} positions from persistence ({} open)",
            positions.len(),
            open_count
        );

        let ledger = Self::new(store, accountant, retry);
        *ledger.positions.write().await = positions;
        Ok(ledger)
    }

    pub fn accountant(&self) -> PnlAccountant {
        self.accountant
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn store(&self) -> Arc<dyn PositionStore> {
        Arc::clone(&self.store)
    }

    async fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        let mut locks = self.symbol_locks.lock().await;
        locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn symbol_of(&self, id: Uuid) -> TradingResult<String> {
        self.positions
            .read()
            .await
            .get(&id)
            .map(|p| p.symbol.clone())
            .ok_or(TradingError::NotFound(id))
    }

    /// Open a position for `signal`
    ///
    /// Fails with `DuplicateSignal` when the signal already produced a
    /// position (open or closed) and with `DuplicateExposure` while the symbol
    /// already has an open position. Nothing is committed in memory unless the
    /// write succeeded.
    pub async fn open(
        &self,
        signal: &Signal,
        sizing: PositionSizing,
        opened_at: DateTime<Utc>,
    ) -> TradingResult<Position> {
        let lock = self.symbol_lock(&signal.symbol).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.position_for_signal(signal.id).await {
            return Err(TradingError::DuplicateSignal {
                signal_id: signal.id,
                existing: existing.id,
            });
        }

        if let Some(existing) = self.open_for_symbol(&signal.symbol).await {
            return Err(TradingError::DuplicateExposure {
                symbol: signal.symbol.clone(),
                existing: existing.id,
            });
        }

        let position = Position::open(signal, sizing, opened_at);

        let store = self.store.as_ref();
        self.retry
            .run("open position", || store.upsert_position(&position))
            .await?;

        self.positions
            .write()
            .await
            .insert(position.id, position.clone());

        tracing::info!(
            "🟢 Opened {} {} @ ${:.4} (size: {:.6}, risk: ${:.2}, stop: ${:.4}, target: ${:.4})",
            position.direction,
            position.symbol,
            position.entry_price,
            position.size,
            position.risk_amount,
            position.stop_price,
            position.target_price
        );

        Ok(position)
    }

    /// Update the mark of an open position
    ///
    /// Marks are buffered and written by `flush_marks`. Marking a closed
    /// position is a no-op that returns the stored record.
    pub async fn mark(&self, id: Uuid, current_price: f64) -> TradingResult<Position> {
        ensure_price(current_price)?;

        let symbol = self.symbol_of(id).await?;
        let lock = self.symbol_lock(&symbol).await;
        let _guard = lock.lock().await;

        let mut positions = self.positions.write().await;
        let position = positions.get_mut(&id).ok_or(TradingError::NotFound(id))?;

        if !position.is_open() {
            tracing::debug!("Ignoring mark for closed position {}", id);
            return Ok(position.clone());
        }

        let unrealized = PnlAccountant::raw_pnl(position, current_price);
        position.apply_mark(current_price, unrealized);
        let marked = position.clone();
        drop(positions);

        self.dirty_marks.lock().await.insert(id);

        Ok(marked)
    }

    /// Idempotent close; the first caller transitions the position
    pub async fn close_position(
        &self,
        id: Uuid,
        exit_price: f64,
        reason: CloseReason,
        closed_at: DateTime<Utc>,
    ) -> TradingResult<CloseOutcome> {
        ensure_price(exit_price)?;

        let symbol = self.symbol_of(id).await?;
        let lock = self.symbol_lock(&symbol).await;
        let _guard = lock.lock().await;

        let current = self.get(id).await.ok_or(TradingError::NotFound(id))?;
        if !current.is_open() {
            tracing::debug!("Position {} already closed ({:?})", id, current.close_reason);
            return Ok(CloseOutcome::AlreadyClosed(current));
        }

        let realized = self.accountant.settle(&current, exit_price, reason);
        let mut closed = current;
        closed.apply_close(exit_price, reason, closed_at, realized);

        let store = self.store.as_ref();
        let written = self
            .retry
            .run("close position", || store.upsert_position(&closed))
            .await?;

        if !written {
            // The row was closed by another writer; its record wins
            let stored = self
                .retry
                .run("load position", || store.load_position(id))
                .await?
                .ok_or(TradingError::NotFound(id))?;

            tracing::warn!(
                "Position {} was closed externally ({}); adopting stored record",
                id,
                stored
                    .close_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );

            self.positions.write().await.insert(id, stored.clone());
            self.dirty_marks.lock().await.remove(&id);
            return Ok(CloseOutcome::AlreadyClosed(stored));
        }

        self.positions.write().await.insert(id, closed.clone());
        self.dirty_marks.lock().await.remove(&id);

        let emoji = if realized >= 0.0 { "💰" } else { "📉" };
        tracing::info!(
            "{} Closed {} {} @ ${:.4} ({}) P&L: ${:+.2}",
            emoji,
            closed.direction,
            closed.symbol,
            exit_price,
            reason,
            realized
        );

        Ok(CloseOutcome::Closed(closed))
    }

    /// Close and return the resulting record, whoever closed it
    pub async fn close(
        &self,
        id: Uuid,
        exit_price: f64,
        reason: CloseReason,
        closed_at: DateTime<Utc>,
    ) -> TradingResult<Position> {
        self.close_position(id, exit_price, reason, closed_at)
            .await
            .map(CloseOutcome::into_position)
    }

    /// Persist buffered marks
    ///
    /// Marks that fail to write are re-queued for the next flush, as are rows
    /// another writer closed whose stored record could not be loaded. Returns
    /// the number of rows written.
    pub async fn flush_marks(&self) -> TradingResult<usize> {
        let pending: Vec<Uuid> = self.dirty_marks.lock().await.drain().collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let store = self.store.as_ref();
        let mut flushed = 0;
        let mut last_error = None;

        for id in pending {
            let Ok(symbol) = self.symbol_of(id).await else {
                continue;
            };
            let lock = self.symbol_lock(&symbol).await;
            let _guard = lock.lock().await;

            let Some(position) = self.get(id).await.filter(|p| p.is_open()) else {
                continue;
            };

            match self
                .retry
                .run("flush mark", || store.upsert_position(&position))
                .await
            {
                Ok(true) => flushed += 1,
                Ok(false) => match self
                    .retry
                    .run("load position", || store.load_position(id))
                    .await
                {
                    Ok(Some(stored)) => {
                        tracing::warn!(
                            "Position {} was closed externally; adopting stored record",
                            id
                        );
                        self.positions.write().await.insert(id, stored);
                    }
                    Ok(None) => {
                        tracing::error!("Mark flush for {} rejected but no stored row found", id);
                        last_error = Some(TradingError::NotFound(id));
                    }
                    Err(e) => {
                        tracing::error!("Failed to load externally closed position {}: {}", id, e);
                        self.dirty_marks.lock().await.insert(id);
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    self.dirty_marks.lock().await.insert(id);
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            return Err(e);
        }

        tracing::debug!("Flushed {} marks", flushed);
        Ok(flushed)
    }

    pub async fn get(&self, id: Uuid) -> Option<Position> {
        self.positions.read().await.get(&id).cloned()
    }

    /// Snapshot of the open positions, oldest first
    pub async fn get_open(&self) -> impl Iterator<Item = Position> {
        let mut open: Vec<Position> = self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|p| p.opened_at);
        open.into_iter()
    }

    /// The position opened from `signal_id`, whatever its status
    pub async fn position_for_signal(&self, signal_id: Uuid) -> Option<Position> {
        self.positions
            .read()
            .await
            .values()
            .find(|p| p.signal_id == signal_id)
            .cloned()
    }

    pub async fn open_for_symbol(&self, symbol: &str) -> Option<Position> {
        self.positions
            .read()
            .await
            .values()
            .find(|p| p.is_open() && p.symbol == symbol)
            .cloned()
    }

    /// Every known position, oldest first
    pub async fn all_positions(&self) -> Vec<Position> {
        let mut all: Vec<Position> = self.positions.read().await.values().cloned().collect();
        all.sort_by_key(|p| p.opened_at);
        all
    }

    pub async fn open_count(&self) -> usize {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.is_open())
            .count()
    }

    /// Drop closed history before `date` from the store and from memory
    pub async fn purge_closed_before(&self, date: NaiveDate, reason: &str) -> TradingResult<u64> {
        let store = self.store.as_ref();
        let purged = self
            .retry
            .run("purge closed positions", || {
                store.purge_closed_before(date, reason)
            })
            .await?;

        self.positions.write().await.retain(|_, p| {
            p.is_open() || p.closed_at.map_or(true, |t| t.date_naive() >= date)
        });

        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqlitePersistence;
    use crate::execution::PositionStatus;
    use crate::models::Direction;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn signal(symbol: &str) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            stop_price: 95.0,
            target_price: 115.0,
            confidence: 0.6,
            created_at: t0(),
        }
    }

    fn sizing() -> PositionSizing {
        PositionSizing {
            size: 0.2,
            risk_amount: 1.0,
        }
    }

    async fn ledger() -> (PositionLedger, Arc<SqlitePersistence>) {
        let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let ledger = PositionLedger::new(store.clone(), PnlAccountant::default(), RetryPolicy::none());
        (ledger, store)
    }

    #[tokio::test]
    async fn test_open_persists_before_commit() {
        let (ledger, store) = ledger().await;

        let position = ledger.open(&signal("SOL"), sizing(), t0()).await.unwrap();

        assert!(ledger.get(position.id).await.is_some());
        let stored = store.load_position(position.id).await.unwrap().unwrap();
        assert_eq!(stored, position);
    }

    #[tokio::test]
    async fn test_duplicate_exposure_rejected() {
        let (ledger, _store) = ledger().await;
        let first = ledger.open(&signal("SOL"), sizing(), t0()).await.unwrap();

        let err = ledger.open(&signal("SOL"), sizing(), t0()).await.unwrap_err();
        match err {
            TradingError::DuplicateExposure { symbol, existing } => {
                assert_eq!(symbol, "SOL");
                assert_eq!(existing, first.id);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(ledger.open_count().await, 1);
    }

    #[tokio::test]
    async fn test_mark_updates_unrealized() {
        let (ledger, _store) = ledger().await;
        let position = ledger.open(&signal("SOL"), sizing(), t0()).await.unwrap();

        let marked = ledger.mark(position.id, 110.0).await.unwrap();
        assert_eq!(marked.current_price, Some(110.0));
        assert!((marked.unrealized_pnl.unwrap() - 2.0).abs() < 1e-9);

        assert!(matches!(
            ledger.mark(Uuid::new_v4(), 110.0).await,
            Err(TradingError::NotFound(_))
        ));
        assert!(matches!(
            ledger.mark(position.id, f64::NAN).await,
            Err(TradingError::InvalidPrice(_))
        ));
    }

    #[tokio::test]
    async fn test_marks_are_buffered_until_flush() {
        let (ledger, store) = ledger().await;
        let position = ledger.open(&signal("SOL"), sizing(), t0()).await.unwrap();

        ledger.mark(position.id, 104.0).await.unwrap();
        ledger.mark(position.id, 106.0).await.unwrap();

        let stored = store.load_position(position.id).await.unwrap().unwrap();
        assert_eq!(stored.current_price, Some(100.0));

        assert_eq!(ledger.flush_marks().await.unwrap(), 1);
        let stored = store.load_position(position.id).await.unwrap().unwrap();
        assert_eq!(stored.current_price, Some(106.0));

        // Nothing pending
        assert_eq!(ledger.flush_marks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (ledger, _store) = ledger().await;
        let position = ledger.open(&signal("SOL"), sizing(), t0()).await.unwrap();
        let at = t0() + Duration::minutes(30);

        let first = ledger
            .close_position(position.id, 116.0, CloseReason::TakeProfit, at)
            .await
            .unwrap();
        assert!(first.was_closed_here());

        let second = ledger
            .close_position(position.id, 90.0, CloseReason::Manual, at + Duration::minutes(1))
            .await
            .unwrap();
        assert!(!second.was_closed_here());
        assert_eq!(second.position(), first.position());
        assert_eq!(second.position().close_reason, Some(CloseReason::TakeProfit));

        // Mark after close is a no-op
        let after = ledger.mark(position.id, 120.0).await.unwrap();
        assert_eq!(after.status, PositionStatus::Closed);
        assert_eq!(after.current_price, None);
    }

    #[tokio::test]
    async fn test_adopts_row_closed_by_another_writer() {
        let (ledger, store) = ledger().await;
        let position = ledger.open(&signal("SOL"), sizing(), t0()).await.unwrap();

        let mut external = position.clone();
        external.apply_close(99.0, CloseReason::Manual, t0() + Duration::minutes(5), -0.2);
        store.upsert_position(&external).await.unwrap();

        let outcome = ledger
            .close_position(position.id, 95.0, CloseReason::StopLoss, t0() + Duration::minutes(6))
            .await
            .unwrap();

        assert_eq!(outcome, CloseOutcome::AlreadyClosed(external.clone()));
        assert_eq!(ledger.get(position.id).await.unwrap(), external);
    }

    #[tokio::test]
    async fn test_signal_opens_at_most_one_position() {
        let (ledger, store) = ledger().await;
        let replayed = signal("SOL");
        let first = ledger.open(&replayed, sizing(), t0()).await.unwrap();
        ledger
            .close(first.id, 94.0, CloseReason::StopLoss, t0() + Duration::minutes(3))
            .await
            .unwrap();

        let err = ledger
            .open(&replayed, sizing(), t0() + Duration::minutes(4))
            .await
            .unwrap_err();
        match err {
            TradingError::DuplicateSignal { signal_id, existing } => {
                assert_eq!(signal_id, replayed.id);
                assert_eq!(existing, first.id);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let rows: Vec<Position> = store
            .load_positions()
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.signal_id == replayed.id)
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(ledger.open_count().await, 0);

        // A fresh signal for the same symbol is fine
        assert!(ledger.open(&signal("SOL"), sizing(), t0() + Duration::minutes(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_flush_adopts_row_closed_by_another_writer() {
        let (ledger, store) = ledger().await;
        let position = ledger.open(&signal("SOL"), sizing(), t0()).await.unwrap();
        ledger.mark(position.id, 104.0).await.unwrap();

        let mut external = position.clone();
        external.apply_close(99.0, CloseReason::Manual, t0() + Duration::minutes(5), -0.2);
        store.upsert_position(&external).await.unwrap();

        assert_eq!(ledger.flush_marks().await.unwrap(), 0);

        assert_eq!(ledger.get(position.id).await.unwrap(), external);
        let stored = store.load_position(position.id).await.unwrap().unwrap();
        assert_eq!(stored, external);
        assert_eq!(ledger.open_count().await, 0);

        // The symbol is free again
        let reopened = ledger
            .open(&signal("SOL"), sizing(), t0() + Duration::minutes(6))
            .await
            .unwrap();
        assert!(reopened.is_open());
    }

    #[tokio::test]
    async fn test_restore_reproduces_state() {
        let (ledger, store) = ledger().await;
        let open = ledger.open(&signal("SOL"), sizing(), t0()).await.unwrap();
        let closed = ledger.open(&signal("ETH"), sizing(), t0()).await.unwrap();
        ledger
            .close(closed.id, 116.0, CloseReason::TakeProfit, t0() + Duration::hours(1))
            .await
            .unwrap();

        let restored =
            PositionLedger::restore(store, PnlAccountant::default(), RetryPolicy::none())
                .await
                .unwrap();

        let open_ids: Vec<Uuid> = restored.get_open().await.map(|p| p.id).collect();
        assert_eq!(open_ids, vec![open.id]);
        assert_eq!(restored.all_positions().await.len(), 2);
    }
}
