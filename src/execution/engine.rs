use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::db::PositionStore;
use crate::error::{ensure_price, TradingError, TradingResult};
use crate::execution::{CloseOutcome, CloseReason, ExitPolicy, Position, PositionLedger};
use crate::models::{Account, AccountSnapshot, PriceTick, Signal};
use crate::notify::{LogNotifier, Notifier, TradeEvent};
use crate::risk::{CircuitBreakers, RiskSizer, TradingState};

/// Cadence of the engine's periodic work
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineIntervals {
    pub heartbeat: Duration,
    pub mark_flush: Duration,
    pub snapshot: Duration,
}

impl Default for EngineIntervals {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            mark_flush: Duration::from_secs(10),
            snapshot: Duration::from_secs(300),
        }
    }
}

/// What a price tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Older than the last processed tick for the symbol; ignored
    Late,
    NoPosition,
    Marked(Position),
    Closed(Position),
}

/// Mutation path for signals, ticks and heartbeats
///
/// Work for one symbol is serialized by the ledger's symbol lock; symbols
/// progress independently.
pub struct TradingEngine {
    ledger: PositionLedger,
    store: Arc<dyn PositionStore>,
    sizer: RiskSizer,
    exit_policy: ExitPolicy,
    breakers: CircuitBreakers,
    notifier: Arc<dyn Notifier>,
    base_balance: f64,
    last_tick: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TradingEngine {
    /// # Arguments
    /// * `base_balance` - configured starting balance before any adjustment
    pub fn new(
        ledger: PositionLedger,
        sizer: RiskSizer,
        exit_policy: ExitPolicy,
        base_balance: f64,
    ) -> Self {
        let store = ledger.store();
        Self {
            ledger,
            store,
            sizer,
            exit_policy,
            breakers: CircuitBreakers::disabled(),
            notifier: Arc::new(LogNotifier),
            base_balance,
            last_tick: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_breakers(mut self, breakers: CircuitBreakers) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn exit_policy(&self) -> &ExitPolicy {
        &self.exit_policy
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    pub async fn submit_signal(&self, signal: Signal) -> TradingResult<Position> {
        self.submit_signal_at(signal, Utc::now()).await
    }

    /// Size and open a position for `signal` at time `at`
    pub async fn submit_signal_at(
        &self,
        signal: Signal,
        at: DateTime<Utc>,
    ) -> TradingResult<Position> {
        match self.try_open(&signal, at).await {
            Ok(position) => {
                self.dispatch(TradeEvent::PositionOpened {
                    position: position.clone(),
                });
                Ok(position)
            }
            Err(e) => {
                tracing::warn!(
                    "⚠️  Rejected {} signal for {}: {}",
                    signal.direction,
                    signal.symbol,
                    e
                );
                Err(e)
            }
        }
    }

    async fn try_open(&self, signal: &Signal, at: DateTime<Utc>) -> TradingResult<Position> {
        signal.validate()?;

        let account = self.account().await?;
        let state = self.trading_state(at.date_naive(), account.balance).await?;
        self.breakers
            .check(&state)
            .map_err(TradingError::CircuitBreaker)?;

        let sizing = self.sizer.size(signal, account.balance)?;
        self.ledger.open(signal, sizing, at).await
    }

    /// Daily breaker inputs, rebuilt from the authoritative daily query
    pub async fn trading_state(&self, date: NaiveDate, balance: f64) -> TradingResult<TradingState> {
        let store = self.store.as_ref();
        let retry = self.ledger.retry();

        let daily_pnl = retry
            .run("daily realized pnl", || store.daily_realized_pnl(date))
            .await?;
        let closed_today = retry
            .run("closed positions", || store.closed_positions_on(date))
            .await?;

        Ok(TradingState::from_closed(balance, daily_pnl, &closed_today))
    }

    // ------------------------------------------------------------------
    // Ticks and exits
    // ------------------------------------------------------------------

    /// Mark the symbol's open position and close it if an exit fires
    pub async fn on_tick(&self, tick: &PriceTick) -> TradingResult<TickOutcome> {
        ensure_price(tick.price)?;

        {
            let mut last_tick = self.last_tick.lock().await;
            if let Some(last) = last_tick.get(&tick.symbol) {
                if tick.timestamp < *last {
                    tracing::debug!(
                        "Dropping late tick for {} ({} < {})",
                        tick.symbol,
                        tick.timestamp,
                        last
                    );
                    return Ok(TickOutcome::Late);
                }
            }
            last_tick.insert(tick.symbol.clone(), tick.timestamp);
        }

        let Some(position) = self.ledger.open_for_symbol(&tick.symbol).await else {
            return Ok(TickOutcome::NoPosition);
        };

        let marked = self.ledger.mark(position.id, tick.price).await?;
        if !marked.is_open() {
            return Ok(TickOutcome::NoPosition);
        }

        match self.exit_policy.evaluate(&marked, tick.price, tick.timestamp) {
            Some(trigger) => {
                let closed = self
                    .close_and_notify(marked.id, tick.price, trigger.close_reason(), tick.timestamp)
                    .await?;
                Ok(TickOutcome::Closed(closed))
            }
            None => Ok(TickOutcome::Marked(marked)),
        }
    }

    /// Evaluate every open position at `now` against its last mark
    ///
    /// Closes run concurrently; a slow or failing write for one position is
    /// logged and does not hold up the others. Returns the closed positions,
    /// oldest first.
    pub async fn heartbeat(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<Position> {
        let mut closes = JoinSet::new();

        for position in self.ledger.get_open().await {
            let price = position.last_price();
            let Some(trigger) = self.exit_policy.evaluate(&position, price, now) else {
                continue;
            };

            let engine = Arc::clone(self);
            let reason = trigger.close_reason();
            closes.spawn(async move {
                let result = engine.close_and_notify(position.id, price, reason, now).await;
                (position, result)
            });
        }

        let mut closed = Vec::new();
        while let Some(joined) = closes.join_next().await {
            match joined {
                Ok((_, Ok(p))) => closed.push(p),
                Ok((position, Err(e))) => tracing::error!(
                    "Failed to close {} ({}) on heartbeat: {}",
                    position.symbol,
                    position.id,
                    e
                ),
                Err(e) => tracing::error!("Heartbeat close task failed: {}", e),
            }
        }

        closed.sort_by_key(|p| p.opened_at);
        closed
    }

    /// Operator close; uses the last mark when no price is given
    pub async fn force_close(
        &self,
        id: Uuid,
        price: Option<f64>,
        at: DateTime<Utc>,
    ) -> TradingResult<Position> {
        let exit_price = match price {
            Some(p) => p,
            None => self
                .ledger
                .get(id)
                .await
                .ok_or(TradingError::NotFound(id))?
                .last_price(),
        };

        tracing::info!("🛑 Force-closing position {} @ ${:.4}", id, exit_price);
        self.close_and_notify(id, exit_price, CloseReason::Manual, at)
            .await
    }

    async fn close_and_notify(
        &self,
        id: Uuid,
        exit_price: f64,
        reason: CloseReason,
        at: DateTime<Utc>,
    ) -> TradingResult<Position> {
        match self.ledger.close_position(id, exit_price, reason, at).await? {
            CloseOutcome::Closed(position) => {
                self.dispatch(TradeEvent::PositionClosed {
                    position: position.clone(),
                });
                Ok(position)
            }
            CloseOutcome::AlreadyClosed(position) => Ok(position),
        }
    }

    // ------------------------------------------------------------------
    // Account
    // ------------------------------------------------------------------

    /// Balance recomputed from persisted rows
    pub async fn account(&self) -> TradingResult<Account> {
        let store = self.store.as_ref();
        let accountant = self.ledger.accountant();
        let base = self.base_balance;

        self.ledger
            .retry()
            .run("load account", || accountant.account(store, base))
            .await
    }

    /// Move the balance to `target` by recording an explicit adjustment
    pub async fn reset_balance(
        &self,
        target: f64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> TradingResult<Account> {
        if !target.is_finite() || target <= 0.0 {
            return Err(TradingError::InsufficientBalance(target));
        }

        let store = self.store.as_ref();
        let base = self.base_balance;
        let adjustment = self
            .ledger
            .retry()
            .run("reset balance", || {
                store.record_balance_reset(base, target, reason, at)
            })
            .await?;
        let previous_balance = target - adjustment.amount;

        let account = self.account().await?;

        tracing::info!(
            "💵 Balance reset ${:.2} -> ${:.2} ({})",
            previous_balance,
            account.balance,
            reason
        );

        self.dispatch(TradeEvent::BalanceReset {
            previous_balance,
            balance: account.balance,
            reason: reason.to_string(),
        });

        Ok(account)
    }

    pub async fn daily_realized_pnl(&self, date: NaiveDate) -> TradingResult<f64> {
        let store = self.store.as_ref();
        self.ledger
            .retry()
            .run("daily realized pnl", || store.daily_realized_pnl(date))
            .await
    }

    /// Persist an audit checkpoint of the account
    pub async fn snapshot(&self, now: DateTime<Utc>) -> TradingResult<AccountSnapshot> {
        let account = self.account().await?;
        let snapshot = AccountSnapshot {
            taken_at: now,
            starting_balance: account.starting_balance,
            balance: account.balance,
            realized_pnl: account.realized_pnl(),
            open_positions: self.ledger.open_count().await as i64,
        };

        let store = self.store.as_ref();
        self.ledger
            .retry()
            .run("save snapshot", || store.save_account_snapshot(&snapshot))
            .await?;

        tracing::info!(
            "📊 Balance: ${:.2} (realized: ${:+.2}, open positions: {})",
            snapshot.balance,
            snapshot.realized_pnl,
            snapshot.open_positions
        );

        Ok(snapshot)
    }

    pub async fn flush_marks(&self) -> TradingResult<usize> {
        self.ledger.flush_marks().await
    }

    pub async fn purge_closed_before(&self, date: NaiveDate, reason: &str) -> TradingResult<u64> {
        self.ledger.purge_closed_before(date, reason).await
    }

    // ------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------

    /// Drive the engine until both input channels close
    ///
    /// Ticks are fanned out to one worker per symbol, so a stalled write for
    /// one symbol never delays exit evaluation for another. Signals and the
    /// periodic jobs run as their own tasks; a periodic job is skipped while
    /// its previous run is still in flight.
    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<Signal>,
        mut ticks: mpsc::Receiver<PriceTick>,
        intervals: EngineIntervals,
    ) {
        let mut heartbeat = interval(intervals.heartbeat);
        let mut mark_flush = interval(intervals.mark_flush);
        let mut snapshot = interval(intervals.snapshot);
        for timer in [&mut heartbeat, &mut mark_flush, &mut snapshot] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        let mut workers: HashMap<String, mpsc::UnboundedSender<PriceTick>> = HashMap::new();
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut heartbeat_job: Option<JoinHandle<()>> = None;
        let mut flush_job: Option<JoinHandle<()>> = None;
        let mut snapshot_job: Option<JoinHandle<()>> = None;

        let mut signals_open = true;
        let mut ticks_open = true;

        tracing::info!(
            "Engine loop started (heartbeat: {:?}, mark flush: {:?}, snapshot: {:?})",
            intervals.heartbeat,
            intervals.mark_flush,
            intervals.snapshot
        );

        while signals_open || ticks_open {
            tokio::select! {
                maybe_signal = signals.recv(), if signals_open => match maybe_signal {
                    Some(signal) => {
                        let engine = Arc::clone(&self);
                        tasks.spawn(async move {
                            // Rejections are logged in submit_signal_at
                            let _ = engine.submit_signal(signal).await;
                        });
                    }
                    None => {
                        tracing::info!("Signal channel closed");
                        signals_open = false;
                    }
                },
                maybe_tick = ticks.recv(), if ticks_open => match maybe_tick {
                    Some(tick) => self.route_tick(&mut workers, &mut tasks, tick),
                    None => {
                        tracing::info!("Price feed channel closed");
                        ticks_open = false;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Engine task failed: {}", e);
                    }
                }
                _ = heartbeat.tick() => {
                    if is_running(&heartbeat_job) {
                        tracing::warn!("Previous heartbeat still running, skipping");
                    } else {
                        let engine = Arc::clone(&self);
                        heartbeat_job = Some(tokio::spawn(async move {
                            let closed = engine.heartbeat(Utc::now()).await;
                            if !closed.is_empty() {
                                tracing::info!("Heartbeat closed {} positions", closed.len());
                            }
                        }));
                    }
                }
                _ = mark_flush.tick() => {
                    if !is_running(&flush_job) {
                        let engine = Arc::clone(&self);
                        flush_job = Some(tokio::spawn(async move {
                            if let Err(e) = engine.flush_marks().await {
                                tracing::error!("Mark flush failed: {}", e);
                            }
                        }));
                    }
                }
                _ = snapshot.tick() => {
                    if !is_running(&snapshot_job) {
                        let engine = Arc::clone(&self);
                        snapshot_job = Some(tokio::spawn(async move {
                            if let Err(e) = engine.snapshot(Utc::now()).await {
                                tracing::error!("Account snapshot failed: {}", e);
                            }
                        }));
                    }
                }
            }
        }

        // Workers drain their queues and exit once their sender is gone
        drop(workers);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Engine task failed: {}", e);
            }
        }
        for job in [heartbeat_job, flush_job, snapshot_job].into_iter().flatten() {
            if let Err(e) = job.await {
                tracing::error!("Periodic job failed: {}", e);
            }
        }

        if let Err(e) = self.flush_marks().await {
            tracing::error!("Final mark flush failed: {}", e);
        }

        tracing::info!("Engine loop stopped");
    }

    /// Hand `tick` to its symbol's worker, starting one on first sight
    fn route_tick(
        self: &Arc<Self>,
        workers: &mut HashMap<String, mpsc::UnboundedSender<PriceTick>>,
        tasks: &mut JoinSet<()>,
        tick: PriceTick,
    ) {
        let worker = workers.entry(tick.symbol.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tasks.spawn(Arc::clone(self).symbol_worker(tick.symbol.clone(), rx));
            tx
        });

        if let Err(e) = worker.send(tick) {
            tracing::error!("Tick worker for {} is gone, dropping tick", e.0.symbol);
        }
    }

    /// Process one symbol's ticks in arrival order
    async fn symbol_worker(
        self: Arc<Self>,
        symbol: String,
        mut ticks: mpsc::UnboundedReceiver<PriceTick>,
    ) {
        tracing::debug!("Tick worker for {} started", symbol);

        while let Some(tick) = ticks.recv().await {
            if let Err(e) = self.on_tick(&tick).await {
                tracing::error!("Tick for {} failed: {}", tick.symbol, e);
            }
        }

        tracing::debug!("Tick worker for {} stopped", symbol);
    }

    /// Fire-and-forget delivery; failures are logged only
    fn dispatch(&self, event: TradeEvent) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&event).await {
                tracing::warn!("Notification dropped ({}): {:#}", event.summary(), e);
            }
        });
    }
}

fn is_running(job: &Option<JoinHandle<()>>) -> bool {
    job.as_ref().is_some_and(|h| !h.is_finished())
}
