// Outbound trade notifications
pub mod webhook;

pub use webhook::WebhookNotifier;

use async_trait::async_trait;
use serde::Serialize;

use crate::execution::Position;

/// Something worth telling the outside world about
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradeEvent {
    PositionOpened {
        position: Position,
    },
    PositionClosed {
        position: Position,
    },
    BalanceReset {
        previous_balance: f64,
        balance: f64,
        reason: String,
    },
}

impl TradeEvent {
    /// One-line human readable description
    pub fn summary(&self) -> String {
        match self {
            TradeEvent::PositionOpened { position } => format!(
                "Opened {} {} @ ${:.4} (risk ${:.2})",
                position.direction, position.symbol, position.entry_price, position.risk_amount
            ),
            TradeEvent::PositionClosed { position } => format!(
                "Closed {} {} @ ${:.4} ({}) P&L ${:+.2}",
                position.direction,
                position.symbol,
                position.exit_price.unwrap_or(position.entry_price),
                position
                    .close_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "UNKNOWN".to_string()),
                position.realized_pnl.unwrap_or(0.0)
            ),
            TradeEvent::BalanceReset {
                previous_balance,
                balance,
                reason,
            } => format!(
                "Balance reset ${:.2} -> ${:.2} ({})",
                previous_balance, balance, reason
            ),
        }
    }
}

/// Delivery channel for trade events
///
/// Failures are reported to the caller, which logs and drops them; a
/// notification never affects trading state.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &TradeEvent) -> anyhow::Result<()>;
}

/// Writes events to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &TradeEvent) -> anyhow::Result<()> {
        tracing::info!("📣 {}", event.summary());
        Ok(())
    }
}
