//! Configuration for paperbot
//!
//! Layers an optional TOML file under environment variables prefixed
//! `PAPERBOT__` (e.g. `PAPERBOT__RISK__RISK_FRACTION=0.02`).

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::db::SqlitePersistence;
use crate::execution::{
    EngineIntervals, ExitPolicy, PnlAccountant, PositionLedger, RetryPolicy, TradingEngine,
};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::risk::{CircuitBreakers, RiskSizer};

const DEFAULT_CONFIG_PATH: &str = "config/default";

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub account: AccountConfig,
    pub risk: RiskConfig,
    pub exits: ExitsConfig,
    pub engine: EngineConfig,
    pub persistence: PersistenceConfig,
    pub notifications: NotificationsConfig,
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Initial virtual balance before any adjustment
    pub starting_balance: f64,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            starting_balance: 100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of balance lost if the stop is hit (0.01 = 1%)
    pub risk_fraction: f64,
    /// Extra stop-loss loss allowed beyond risk, as a fraction of risk
    pub stop_slippage_tolerance: f64,
    pub min_confidence: f64,
    pub max_daily_loss_pct: f64,
    pub max_consecutive_losses: u32,
    pub max_daily_trades: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        let breakers = CircuitBreakers::default();
        Self {
            risk_fraction: 0.01,
            stop_slippage_tolerance: 0.0,
            min_confidence: 0.0,
            max_daily_loss_pct: breakers.max_daily_loss_pct,
            max_consecutive_losses: breakers.max_consecutive_losses,
            max_daily_trades: breakers.max_daily_trades,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExitsConfig {
    pub max_hold_minutes: i64,
    /// Daily UTC session close as "HH:MM"; unset disables session exits
    pub session_close_utc: Option<String>,
    pub session_close_warning_minutes: i64,
}

impl Default for ExitsConfig {
    fn default() -> Self {
        Self {
            max_hold_minutes: 240,
            session_close_utc: None,
            session_close_warning_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub heartbeat_secs: u64,
    pub mark_flush_secs: u64,
    pub snapshot_secs: u64,
    /// Capacity of the signal and tick channels
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let intervals = EngineIntervals::default();
        Self {
            heartbeat_secs: intervals.heartbeat.as_secs(),
            mark_flush_secs: intervals.mark_flush.as_secs(),
            snapshot_secs: intervals.snapshot.as_secs(),
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub database_url: String,
    pub retry_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            database_url: "sqlite://paperbot.db".to_string(),
            retry_attempts: retry.max_attempts,
            retry_initial_delay_ms: retry.initial_delay.as_millis() as u64,
            retry_max_delay_ms: retry.max_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Webhook receiving trade events; log-only when unset
    pub webhook_url: Option<String>,
    pub max_per_minute: u32,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            max_per_minute: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Base symbols to poll (e.g. "SOL")
    pub symbols: Vec<String>,
    pub quote_asset: String,
    pub base_url: String,
    pub poll_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["SOL".to_string(), "BTC".to_string(), "ETH".to_string()],
            quote_asset: "USDT".to_string(),
            base_url: "https://api.binance.com".to_string(),
            poll_secs: 15,
        }
    }
}

impl AppConfig {
    /// Load `config/default.toml` (if present) and `PAPERBOT__*` overrides
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("PAPERBOT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("feed.symbols"),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.account.starting_balance > 0.0) {
            bail!(
                "account.starting_balance must be positive, got {}",
                self.account.starting_balance
            );
        }

        if !(self.risk.risk_fraction > 0.0 && self.risk.risk_fraction < 1.0) {
            bail!(
                "risk.risk_fraction must be within (0, 1), got {}",
                self.risk.risk_fraction
            );
        }

        if self.risk.stop_slippage_tolerance < 0.0 {
            bail!("risk.stop_slippage_tolerance must not be negative");
        }

        if !(0.0..=1.0).contains(&self.risk.min_confidence) {
            bail!("risk.min_confidence must be within [0, 1]");
        }

        if self.exits.max_hold_minutes <= 0 {
            bail!("exits.max_hold_minutes must be positive");
        }

        if self.exits.session_close_warning_minutes < 0 {
            bail!("exits.session_close_warning_minutes must not be negative");
        }

        if let Some(close) = &self.exits.session_close_utc {
            parse_session_close(close)?;
        }

        if self.engine.heartbeat_secs == 0
            || self.engine.mark_flush_secs == 0
            || self.engine.snapshot_secs == 0
        {
            bail!("engine intervals must be at least one second");
        }

        if self.persistence.retry_attempts == 0 {
            bail!("persistence.retry_attempts must be at least 1");
        }

        if self.feed.poll_secs == 0 {
            bail!("feed.poll_secs must be at least one second");
        }

        Ok(())
    }

    pub fn exit_policy(&self) -> Result<ExitPolicy> {
        let policy = ExitPolicy::new(chrono::Duration::minutes(self.exits.max_hold_minutes));

        match &self.exits.session_close_utc {
            Some(close) => Ok(policy.with_session_close(
                parse_session_close(close)?,
                chrono::Duration::minutes(self.exits.session_close_warning_minutes),
            )),
            None => Ok(policy),
        }
    }

    pub fn sizer(&self) -> Result<RiskSizer> {
        let sizer = RiskSizer::fixed(self.risk.risk_fraction)
            .context("Invalid risk configuration")?
            .with_min_confidence(self.risk.min_confidence);
        Ok(sizer)
    }

    pub fn breakers(&self) -> CircuitBreakers {
        CircuitBreakers {
            max_daily_loss_pct: self.risk.max_daily_loss_pct,
            max_consecutive_losses: self.risk.max_consecutive_losses,
            max_daily_trades: self.risk.max_daily_trades,
        }
    }

    pub fn accountant(&self) -> PnlAccountant {
        PnlAccountant::new(self.risk.stop_slippage_tolerance)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.persistence.retry_attempts,
            initial_delay: Duration::from_millis(self.persistence.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.persistence.retry_max_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn intervals(&self) -> EngineIntervals {
        EngineIntervals {
            heartbeat: Duration::from_secs(self.engine.heartbeat_secs),
            mark_flush: Duration::from_secs(self.engine.mark_flush_secs),
            snapshot: Duration::from_secs(self.engine.snapshot_secs),
        }
    }

    pub fn notifier(&self) -> Result<Arc<dyn Notifier>> {
        match &self.notifications.webhook_url {
            Some(url) => {
                tracing::info!("Webhook notifications enabled ({})", url);
                Ok(Arc::new(WebhookNotifier::new(
                    url.clone(),
                    self.notifications.max_per_minute,
                )?))
            }
            None => Ok(Arc::new(LogNotifier)),
        }
    }

    /// Connect the store, restore the ledger and assemble the engine
    pub async fn build_engine(&self) -> Result<TradingEngine> {
        let store = SqlitePersistence::new(&self.persistence.database_url)
            .await
            .with_context(|| {
                format!("Failed to open database {}", self.persistence.database_url)
            })?;

        let ledger = PositionLedger::restore(
            Arc::new(store),
            self.accountant(),
            self.retry_policy(),
        )
        .await
        .context("Failed to restore positions")?;

        let engine = TradingEngine::new(
            ledger,
            self.sizer()?,
            self.exit_policy()?,
            self.account.starting_balance,
        )
        .with_breakers(self.breakers())
        .with_notifier(self.notifier()?);

        Ok(engine)
    }
}

fn parse_session_close(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .with_context(|| format!("exits.session_close_utc must be HH:MM, got '{}'", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.exit_policy().unwrap().max_hold(), chrono::Duration::hours(4));
        assert!(config.exit_policy().unwrap().session().is_none());
        assert_eq!(config.retry_policy().max_attempts, 3);
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let config = AppConfig::load_from("config/does-not-exist").unwrap();
        assert_eq!(config.feed.quote_asset, "USDT");
        assert!(config.sizer().is_ok());
    }

    #[test]
    fn test_session_close_parsing() {
        let mut config = AppConfig::default();
        config.exits.session_close_utc = Some("21:00".to_string());

        let session = config.exit_policy().unwrap().session().unwrap();
        assert_eq!(session.close_time, NaiveTime::from_hms_opt(21, 0, 0).unwrap());
        assert_eq!(session.warning_window, chrono::Duration::minutes(15));

        config.exits.session_close_utc = Some("9pm".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_risk_fraction() {
        let mut config = AppConfig::default();
        config.risk.risk_fraction = 1.5;
        assert!(config.validate().is_err());

        config.risk.risk_fraction = 0.0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_build_engine_in_memory() {
        let mut config = AppConfig::default();
        config.persistence.database_url = "sqlite::memory:".to_string();

        let engine = config.build_engine().await.unwrap();
        let account = engine.account().await.unwrap();
        assert_eq!(account.balance, 100.0);
    }

    #[test]
    fn test_breakers_follow_risk_section() {
        let mut config = AppConfig::default();
        config.risk.max_daily_trades = 3;
        assert_eq!(config.breakers().max_daily_trades, 3);
    }
}
