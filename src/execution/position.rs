use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::{Direction, Signal};
use crate::risk::PositionSizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::Open => "Open",
            PositionStatus::Closed => "Closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Open" => Some(PositionStatus::Open),
            "Closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

/// Which time rule forced the exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeExitKind {
    MaxHoldTimeExceeded,
    SessionClose,
}

impl TimeExitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeExitKind::MaxHoldTimeExceeded => "MAX_HOLD_TIME_EXCEEDED",
            TimeExitKind::SessionClose => "SESSION_CLOSE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MAX_HOLD_TIME_EXCEEDED" => Some(TimeExitKind::MaxHoldTimeExceeded),
            "SESSION_CLOSE" => Some(TimeExitKind::SessionClose),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    TimeExit(TimeExitKind),
    Manual,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::StopLoss => "STOP_LOSS",
            CloseReason::TakeProfit => "TAKE_PROFIT",
            CloseReason::TimeExit(_) => "TIME_EXIT",
            CloseReason::Manual => "MANUAL",
        }
    }

    pub fn time_exit_kind(self) -> Option<TimeExitKind> {
        match self {
            CloseReason::TimeExit(kind) => Some(kind),
            _ => None,
        }
    }

    /// Rebuild from the stored `(close_reason, time_exit_kind)` column pair
    pub fn parse(reason: &str, time_exit_kind: Option<&str>) -> Option<Self> {
        match reason {
            "STOP_LOSS" => Some(CloseReason::StopLoss),
            "TAKE_PROFIT" => Some(CloseReason::TakeProfit),
            "MANUAL" => Some(CloseReason::Manual),
            "TIME_EXIT" => time_exit_kind
                .and_then(TimeExitKind::parse)
                .map(CloseReason::TimeExit),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TimeExit(kind) => write!(f, "TIME_EXIT/{}", kind.as_str()),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A simulated position
///
/// Static fields are fixed at open. Terminal fields are written once, by
/// the ledger's close path, with PnL coming from the accountant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub signal_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub size: f64,
    pub risk_amount: f64,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub exit_price: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub current_price: Option<f64>,
}

impl Position {
    /// New OPEN position marked at its entry price
    pub fn open(signal: &Signal, sizing: PositionSizing, opened_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal_id: signal.id,
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            entry_price: signal.entry_price,
            stop_price: signal.stop_price,
            target_price: signal.target_price,
            size: sizing.size,
            risk_amount: sizing.risk_amount,
            opened_at,
            status: PositionStatus::Open,
            close_reason: None,
            exit_price: None,
            closed_at: None,
            realized_pnl: None,
            unrealized_pnl: Some(0.0),
            current_price: Some(signal.entry_price),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Last known price: the latest mark, or entry if never marked
    pub fn last_price(&self) -> f64 {
        self.current_price.unwrap_or(self.entry_price)
    }

    pub(crate) fn apply_mark(&mut self, price: f64, unrealized_pnl: f64) {
        self.current_price = Some(price);
        self.unrealized_pnl = Some(unrealized_pnl);
    }

    pub(crate) fn apply_close(
        &mut self,
        exit_price: f64,
        reason: CloseReason,
        closed_at: DateTime<Utc>,
        realized_pnl: f64,
    ) {
        self.status = PositionStatus::Closed;
        self.close_reason = Some(reason);
        self.exit_price = Some(exit_price);
        self.closed_at = Some(closed_at);
        self.realized_pnl = Some(realized_pnl);
        self.unrealized_pnl = None;
        self.current_price = None;
    }

    /// Status and terminal fields agree
    pub fn is_consistent(&self) -> bool {
        let terminal_set = self.exit_price.is_some()
            && self.closed_at.is_some()
            && self.realized_pnl.is_some()
            && self.close_reason.is_some()
            && self.unrealized_pnl.is_none();
        let terminal_clear = self.exit_price.is_none()
            && self.closed_at.is_none()
            && self.realized_pnl.is_none()
            && self.close_reason.is_none()
            && self.unrealized_pnl.is_some();

        let fields_ok = match self.status {
            PositionStatus::Closed => terminal_set,
            PositionStatus::Open => terminal_clear,
        };

        fields_ok && self.size > 0.0 && self.risk_amount > 0.0
    }
}
