use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{TradingError, TradingResult};

/// Trade direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[serde(alias = "BUY", alias = "long", alias = "buy")]
    Long,
    #[serde(alias = "SELL", alias = "short", alias = "sell")]
    Short,
}

impl Direction {
    /// +1 for longs, -1 for shorts
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Direction::Long),
            "SHORT" | "SELL" => Ok(Direction::Short),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// Scored trade idea produced by an external scorer
///
/// Immutable once issued; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub confidence: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Signal {
    /// Check that prices are usable and sit on the correct side of entry
    ///
    /// LONG: stop < entry < target. SHORT: target < entry < stop.
    pub fn validate(&self) -> TradingResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(TradingError::InvalidSignal("empty symbol".to_string()));
        }

        for (name, value) in [
            ("entry_price", self.entry_price),
            ("stop_price", self.stop_price),
            ("target_price", self.target_price),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(TradingError::InvalidSignal(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(TradingError::InvalidSignal(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }

        let levels_ok = match self.direction {
            Direction::Long => {
                self.stop_price < self.entry_price && self.entry_price < self.target_price
            }
            Direction::Short => {
                self.target_price < self.entry_price && self.entry_price < self.stop_price
            }
        };

        if !levels_ok {
            return Err(TradingError::InvalidSignal(format!(
                "{} {} levels inconsistent: entry {} stop {} target {}",
                self.direction, self.symbol, self.entry_price, self.stop_price, self.target_price
            )));
        }

        Ok(())
    }

    /// Distance between entry and stop
    pub fn stop_distance(&self) -> f64 {
        (self.entry_price - self.stop_price).abs()
    }
}

/// A single price observation for a symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    pub fn new(symbol: impl Into<String>, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
        }
    }
}

/// Account view derived from the ledger
///
/// `balance = starting_balance + Σ realized_pnl` over every closed position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub starting_balance: f64,
    pub balance: f64,
}

impl Account {
    pub fn realized_pnl(&self) -> f64 {
        self.balance - self.starting_balance
    }
}

/// Audit row for an administrative change to the starting balance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalanceAdjustment {
    pub id: Uuid,
    pub amount: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl BalanceAdjustment {
    pub fn new(amount: f64, reason: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            amount,
            reason: reason.into(),
            created_at,
        }
    }
}

/// Periodic balance checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSnapshot {
    pub taken_at: DateTime<Utc>,
    pub starting_balance: f64,
    pub balance: f64,
    pub realized_pnl: f64,
    pub open_positions: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_signal() -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: "SOL".to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            stop_price: 95.0,
            target_price: 115.0,
            confidence: 0.8,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_valid_long_signal() {
        let signal = long_signal();
        assert!(signal.validate().is_ok());
        assert_eq!(signal.stop_distance(), 5.0);
    }

    #[test]
    fn test_long_with_stop_above_entry_rejected() {
        let mut signal = long_signal();
        signal.stop_price = 101.0;

        let result = signal.validate();
        assert!(matches!(result, Err(TradingError::InvalidSignal(_))));
    }

    #[test]
    fn test_short_levels() {
        let mut signal = long_signal();
        signal.direction = Direction::Short;
        assert!(signal.validate().is_err());

        signal.stop_price = 105.0;
        signal.target_price = 85.0;
        assert!(signal.validate().is_ok());
    }

    #[test]
    fn test_confidence_out_of_range() {
        let mut signal = long_signal();
        signal.confidence = 1.2;
        assert!(signal.validate().is_err());
    }

    #[test]
    fn test_non_positive_price_rejected() {
        let mut signal = long_signal();
        signal.entry_price = 0.0;
        assert!(signal.validate().is_err());
    }

    #[test]
    fn test_signal_json_aliases_and_defaults() {
        let json = r#"{
            "symbol": "ETH",
            "direction": "SELL",
            "entry_price": 2000.0,
            "stop_price": 2050.0,
            "target_price": 1900.0,
            "confidence": 0.7
        }"#;

        let signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert_eq!(signal.symbol, "ETH");
        assert!(signal.validate().is_ok());
    }

    #[test]
    fn test_direction_from_str() {
        assert_eq!("buy".parse::<Direction>().unwrap(), Direction::Long);
        assert_eq!("SHORT".parse::<Direction>().unwrap(), Direction::Short);
        assert!("sideways".parse::<Direction>().is_err());
        assert_eq!(Direction::Short.sign(), -1.0);
    }
}
