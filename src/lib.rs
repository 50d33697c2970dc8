// Core modules
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod models;
pub mod notify;
pub mod risk;

// Re-export commonly used types
pub use error::{TradingError, TradingResult};
pub use models::*;

// Error handling for binaries and glue code
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
