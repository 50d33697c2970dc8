use thiserror::Error;
use uuid::Uuid;

use crate::db::StoreError;
use crate::risk::CircuitBreakerTrip;

/// Errors surfaced by the position lifecycle
#[derive(Debug, Error)]
pub enum TradingError {
    /// Malformed or contradictory price levels; no position is opened
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("open position {existing} already exists for {symbol}")]
    DuplicateExposure { symbol: String, existing: Uuid },

    /// Each signal opens at most one position over its lifetime
    #[error("signal {signal_id} already opened position {existing}")]
    DuplicateSignal { signal_id: Uuid, existing: Uuid },

    #[error("insufficient balance: ${0:.2}")]
    InsufficientBalance(f64),

    #[error("position {0} not found")]
    NotFound(Uuid),

    /// The gateway never acknowledged the write; in-memory state was left untouched
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    PersistenceFailure {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("risk fraction {0} must be within (0, 1)")]
    InvalidRiskFraction(f64),

    #[error("invalid price {0}")]
    InvalidPrice(f64),

    #[error("confidence {confidence:.2} below minimum {minimum:.2}")]
    LowConfidence { confidence: f64, minimum: f64 },

    #[error("circuit breaker tripped: {0:?}")]
    CircuitBreaker(CircuitBreakerTrip),
}

pub type TradingResult<T> = std::result::Result<T, TradingError>;

/// Reject NaN, infinities and non-positive prices
pub(crate) fn ensure_price(price: f64) -> TradingResult<f64> {
    if price.is_finite() && price > 0.0 {
        Ok(price)
    } else {
        Err(TradingError::InvalidPrice(price))
    }
}
