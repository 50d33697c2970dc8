use crate::db::{PositionStore, StoreError};
use crate::execution::{CloseReason, Position, PositionStatus};
use crate::models::Account;

/// Single home of the PnL arithmetic
///
/// Marks, settlement and the balance formula all go through here; nothing
/// else computes or overwrites `realized_pnl`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PnlAccountant {
    stop_slippage_tolerance: f64,
}

impl PnlAccountant {
    /// # Arguments
    /// * `stop_slippage_tolerance` - extra loss allowed past `risk_amount` on a
    ///   stop, as a fraction of `risk_amount` (0.0 = strict cap)
    pub fn new(stop_slippage_tolerance: f64) -> Self {
        Self {
            stop_slippage_tolerance: stop_slippage_tolerance.max(0.0),
        }
    }

    pub fn stop_slippage_tolerance(&self) -> f64 {
        self.stop_slippage_tolerance
    }

    /// `(price - entry) * size * direction_sign`
    pub fn raw_pnl(position: &Position, price: f64) -> f64 {
        (price - position.entry_price) * position.size * position.direction.sign()
    }

    /// Largest loss a stop-loss close may realize
    pub fn stop_loss_cap(&self, position: &Position) -> f64 {
        position.risk_amount * (1.0 + self.stop_slippage_tolerance)
    }

    /// Realized PnL for closing `position` at `exit_price`
    ///
    /// Stop-loss exits are capped at the pre-committed risk; target, time and
    /// manual exits realize the raw market PnL.
    pub fn settle(&self, position: &Position, exit_price: f64, reason: CloseReason) -> f64 {
        let raw = Self::raw_pnl(position, exit_price);

        match reason {
            CloseReason::StopLoss => -raw.abs().min(self.stop_loss_cap(position)),
            _ => raw,
        }
    }

    /// Apply the balance formula over a set of positions
    pub fn balance_from<'a>(
        starting_balance: f64,
        positions: impl IntoIterator<Item = &'a Position>,
    ) -> Account {
        let realized: f64 = positions
            .into_iter()
            .filter(|p| p.status == PositionStatus::Closed)
            .filter_map(|p| p.realized_pnl)
            .sum();

        Account {
            starting_balance,
            balance: starting_balance + realized,
        }
    }

    /// Account derived from persisted rows
    ///
    /// `starting_balance` is the configured base plus every recorded
    /// adjustment; `balance` adds all persisted realized PnL on top.
    pub async fn account(
        &self,
        store: &dyn PositionStore,
        base_balance: f64,
    ) -> Result<Account, StoreError> {
        let adjustments = store.total_adjustments().await?;
        let realized = store.total_realized_pnl().await?;
        let starting_balance = base_balance + adjustments;

        Ok(Account {
            starting_balance,
            balance: starting_balance + realized,
        })
    }
}
