use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{TradingError, TradingResult};
use crate::models::Signal;

/// Output of the risk sizer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSizing {
    pub size: f64,
    pub risk_amount: f64,
}

/// Size a position so that the loss at the stop equals `risk_fraction` of balance
///
/// Pure function: `risk_amount = balance * risk_fraction`,
/// `size = risk_amount / |entry - stop|`.
pub fn size_position(
    signal: &Signal,
    account_balance: f64,
    risk_fraction: f64,
) -> TradingResult<PositionSizing> {
    signal.validate()?;

    let stop_distance = signal.stop_distance();
    if !(stop_distance > 0.0) {
        return Err(TradingError::InvalidSignal(format!(
            "stop distance must be positive, got {}",
            stop_distance
        )));
    }

    if !(account_balance > 0.0) {
        return Err(TradingError::InsufficientBalance(account_balance));
    }

    if !(risk_fraction > 0.0 && risk_fraction < 1.0) {
        return Err(TradingError::InvalidRiskFraction(risk_fraction));
    }

    let risk_amount = account_balance * risk_fraction;
    let size = risk_amount / stop_distance;

    Ok(PositionSizing { size, risk_amount })
}

/// Where the risk fraction for a signal comes from
///
/// Only a fixed system-wide fraction ships; scaling risk by signal quality
/// plugs in here without touching the sizing arithmetic.
pub trait RiskBudget: Debug + Send + Sync {
    fn risk_fraction(&self, signal: &Signal) -> f64;
}

/// Same fraction for every signal
#[derive(Debug, Clone, Copy)]
pub struct FixedFraction(f64);

impl FixedFraction {
    pub fn new(fraction: f64) -> TradingResult<Self> {
        if fraction > 0.0 && fraction < 1.0 {
            Ok(Self(fraction))
        } else {
            Err(TradingError::InvalidRiskFraction(fraction))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl RiskBudget for FixedFraction {
    fn risk_fraction(&self, _signal: &Signal) -> f64 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct RiskSizer {
    budget: Arc<dyn RiskBudget>,
    min_confidence: f64,
}

impl RiskSizer {
    pub fn new(budget: Arc<dyn RiskBudget>) -> Self {
        Self {
            budget,
            min_confidence: 0.0,
        }
    }

    /// Sizer with a fixed system-wide risk fraction
    pub fn fixed(fraction: f64) -> TradingResult<Self> {
        Ok(Self::new(Arc::new(FixedFraction::new(fraction)?)))
    }

    /// Reject signals scored below `min_confidence`
    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn size(&self, signal: &Signal, account_balance: f64) -> TradingResult<PositionSizing> {
        if signal.confidence < self.min_confidence {
            return Err(TradingError::LowConfidence {
                confidence: signal.confidence,
                minimum: self.min_confidence,
            });
        }

        size_position(signal, account_balance, self.budget.risk_fraction(signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use chrono::Utc;
    use uuid::Uuid;

    fn signal(direction: Direction, entry: f64, stop: f64, target: f64) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: "SOL".to_string(),
            direction,
            entry_price: entry,
            stop_price: stop,
            target_price: target,
            confidence: 0.6,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_size_long_position() {
        let sizing = size_position(&signal(Direction::Long, 100.0, 95.0, 115.0), 100.0, 0.01)
            .unwrap();

        assert!((sizing.risk_amount - 1.0).abs() < 1e-12);
        assert!((sizing.size - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_size_short_position() {
        let sizing = size_position(&signal(Direction::Short, 50.0, 52.0, 44.0), 1000.0, 0.02)
            .unwrap();

        // 2% of 1000 = 20 at risk over a 2.0 stop distance
        assert!((sizing.risk_amount - 20.0).abs() < 1e-9);
        assert!((sizing.size - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_stop_on_wrong_side_is_invalid() {
        let result = size_position(&signal(Direction::Long, 100.0, 105.0, 115.0), 100.0, 0.01);
        assert!(matches!(result, Err(TradingError::InvalidSignal(_))));
    }

    #[test]
    fn test_zero_balance_is_insufficient() {
        let result = size_position(&signal(Direction::Long, 100.0, 95.0, 115.0), 0.0, 0.01);
        assert!(matches!(result, Err(TradingError::InsufficientBalance(_))));
    }

    #[test]
    fn test_risk_fraction_bounds() {
        assert!(FixedFraction::new(0.0).is_err());
        assert!(FixedFraction::new(1.0).is_err());
        assert_eq!(FixedFraction::new(0.01).unwrap().value(), 0.01);

        let result = size_position(&signal(Direction::Long, 100.0, 95.0, 115.0), 100.0, 1.5);
        assert!(matches!(result, Err(TradingError::InvalidRiskFraction(_))));
    }

    #[test]
    fn test_min_confidence_filter() {
        let sizer = RiskSizer::fixed(0.01).unwrap().with_min_confidence(0.7);
        let result = sizer.size(&signal(Direction::Long, 100.0, 95.0, 115.0), 100.0);
        assert!(matches!(result, Err(TradingError::LowConfidence { .. })));
    }

    #[test]
    fn test_fixed_sizer_ignores_confidence() {
        let sizer = RiskSizer::fixed(0.01).unwrap();
        let mut high = signal(Direction::Long, 100.0, 95.0, 115.0);
        high.confidence = 0.99;
        let low = signal(Direction::Long, 100.0, 95.0, 115.0);

        assert_eq!(sizer.size(&high, 100.0).unwrap(), sizer.size(&low, 100.0).unwrap());
    }
}
