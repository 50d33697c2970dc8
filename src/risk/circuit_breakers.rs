use serde::{Deserialize, Serialize};

use crate::execution::Position;

/// Circuit breakers to stop opening positions on a bad day
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakers {
    pub max_daily_loss_pct: f64,
    pub max_consecutive_losses: u32,
    pub max_daily_trades: u32,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: 0.05,  // -5% daily
            max_consecutive_losses: 5, // 5 losses in a row
            max_daily_trades: 10,      // Max 10 closed trades per day
        }
    }
}

/// Daily trading state, derived from persisted closed positions
///
/// Never kept as running counters: rebuilt from the authoritative daily
/// PnL query and that day's closed positions each time it is needed.
#[derive(Debug, Clone, PartialEq)]
pub struct TradingState {
    pub balance: f64,
    pub daily_pnl: f64,
    pub consecutive_losses: u32,
    pub daily_trades: u32,
}

impl TradingState {
    pub fn new(balance: f64) -> Self {
        Self {
            balance,
            daily_pnl: 0.0,
            consecutive_losses: 0,
            daily_trades: 0,
        }
    }

    /// Build state from the day's closed positions (ordered by close time)
    pub fn from_closed(balance: f64, daily_pnl: f64, closed_today: &[Position]) -> Self {
        let consecutive_losses = closed_today
            .iter()
            .rev()
            .take_while(|p| p.realized_pnl.unwrap_or(0.0) < 0.0)
            .count() as u32;

        Self {
            balance,
            daily_pnl,
            consecutive_losses,
            daily_trades: closed_today.len() as u32,
        }
    }

    /// Balance before today's realized PnL
    pub fn start_of_day_balance(&self) -> f64 {
        self.balance - self.daily_pnl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerTrip {
    DailyLoss,
    ConsecutiveLosses,
    DailyTradeLimit,
}

impl CircuitBreakers {
    /// Limits that never trip
    pub fn disabled() -> Self {
        Self {
            max_daily_loss_pct: f64::INFINITY,
            max_consecutive_losses: u32::MAX,
            max_daily_trades: u32::MAX,
        }
    }

    pub fn check(&self, state: &TradingState) -> Result<(), CircuitBreakerTrip> {
        // Check daily loss
        let start = state.start_of_day_balance();
        if start > 0.0 && state.daily_pnl / start < -self.max_daily_loss_pct {
            return Err(CircuitBreakerTrip::DailyLoss);
        }

        // Check consecutive losses
        if state.consecutive_losses >= self.max_consecutive_losses {
            return Err(CircuitBreakerTrip::ConsecutiveLosses);
        }

        // Check daily trade limit
        if state.daily_trades >= self.max_daily_trades {
            return Err(CircuitBreakerTrip::DailyTradeLimit);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{CloseReason, Position};
    use crate::models::{Direction, Signal};
    use crate::risk::PositionSizing;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn closed_with_pnl(pnl: f64, minutes: i64) -> Position {
        let opened_at = Utc::now() - Duration::hours(2);
        let signal = Signal {
            id: Uuid::new_v4(),
            symbol: "SOL".to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            stop_price: 95.0,
            target_price: 115.0,
            confidence: 0.5,
            created_at: opened_at,
        };
        let mut position = Position::open(
            &signal,
            PositionSizing {
                size: 0.2,
                risk_amount: 1.0,
            },
            opened_at,
        );
        let reason = if pnl < 0.0 {
            CloseReason::StopLoss
        } else {
            CloseReason::TakeProfit
        };
        position.apply_close(100.0, reason, opened_at + Duration::minutes(minutes), pnl);
        position
    }

    #[test]
    fn test_circuit_breaker_daily_loss() {
        let breakers = CircuitBreakers::default();
        let mut state = TradingState::new(9400.0);

        // Simulate -6% daily loss
        state.daily_pnl = -600.0;

        let result = breakers.check(&state);
        assert_eq!(result, Err(CircuitBreakerTrip::DailyLoss));
    }

    #[test]
    fn test_circuit_breaker_consecutive_losses() {
        let breakers = CircuitBreakers::default();
        let mut state = TradingState::new(10000.0);

        state.consecutive_losses = 5;

        let result = breakers.check(&state);
        assert_eq!(result, Err(CircuitBreakerTrip::ConsecutiveLosses));
    }

    #[test]
    fn test_circuit_breaker_trade_limit() {
        let breakers = CircuitBreakers::default();
        let mut state = TradingState::new(10000.0);

        state.daily_trades = 10;

        assert_eq!(breakers.check(&state), Err(CircuitBreakerTrip::DailyTradeLimit));
    }

    #[test]
    fn test_circuit_breaker_ok() {
        let breakers = CircuitBreakers::default();
        let state = TradingState::new(10000.0);

        let result = breakers.check(&state);
        assert!(result.is_ok());
    }

    #[test]
    fn test_disabled_never_trips() {
        let breakers = CircuitBreakers::disabled();
        let state = TradingState {
            balance: 10.0,
            daily_pnl: -90.0,
            consecutive_losses: 40,
            daily_trades: 500,
        };
        assert!(breakers.check(&state).is_ok());
    }

    #[test]
    fn test_state_counts_trailing_losses() {
        let closed = vec![
            closed_with_pnl(-1.0, 1),
            closed_with_pnl(2.0, 2),
            closed_with_pnl(-1.0, 3),
            closed_with_pnl(-1.0, 4),
        ];

        let state = TradingState::from_closed(99.0, -1.0, &closed);
        assert_eq!(state.consecutive_losses, 2);
        assert_eq!(state.daily_trades, 4);
        assert_eq!(state.start_of_day_balance(), 100.0);
    }
}
