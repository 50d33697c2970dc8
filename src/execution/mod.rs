pub mod accountant;
pub mod engine;
pub mod exit_policy;
pub mod ledger;
pub mod position;
pub mod retry;

pub use accountant::PnlAccountant;
pub use engine::{EngineIntervals, TickOutcome, TradingEngine};
pub use exit_policy::{ExitPolicy, ExitTrigger, SessionClose};
pub use ledger::{CloseOutcome, PositionLedger};
pub use position::{CloseReason, Position, PositionStatus, TimeExitKind};
pub use retry::RetryPolicy;
