//! Configuration management
//!
//! JSON configuration with environment-variable credential override.
//! Out-of-range values are clamped to safe bounds with a warning; missing
//! required sections refuse startup.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::types::Symbol;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub trading: TradingConfig,
    pub risk_management: RiskManagementConfig,
    #[serde(default)]
    pub pair_trading: PairTradingConfig,
    #[serde(default)]
    pub strategy_allocation: StrategyAllocation,
    #[serde(default)]
    pub reporting: ReportingConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
}

impl Config {
    /// Load configuration from a JSON file, pull credentials from the
    /// environment, clamp unsafe values, and run strict validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        if let Ok(api_key) = std::env::var("BITFLYER_API_KEY") {
            config.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("BITFLYER_API_SECRET") {
            config.exchange.api_secret = Some(api_secret);
        }

        config.enforce_safe_ranges();
        config.validate()?;
        Ok(config)
    }

    /// Clamp risk parameters into safe bounds, warning on every change
    pub fn enforce_safe_ranges(&mut self) {
        let r = &mut self.risk_management;
        clamp_field("stop_loss_pct", &mut r.stop_loss_pct, 1.0, 50.0);
        clamp_field("take_profit_first", &mut r.take_profit_first, 1.0, 200.0);
        clamp_field("take_profit_second", &mut r.take_profit_second, 1.0, 200.0);
        clamp_field("max_position_size", &mut r.max_position_size, 0.1, 0.95);
        clamp_field("max_drawdown_pct", &mut r.max_drawdown_pct, 5.0, 50.0);
        clamp_field("max_daily_loss_pct", &mut r.max_daily_loss_pct, 0.1, 50.0);
        clamp_field("max_weekly_loss_pct", &mut r.max_weekly_loss_pct, 0.1, 50.0);
        clamp_field("max_monthly_loss_pct", &mut r.max_monthly_loss_pct, 0.1, 50.0);
        clamp_field("risk_per_trade_pct", &mut r.risk_per_trade_pct, 0.1, 10.0);
        clamp_int_field("consecutive_loss_limit", &mut r.consecutive_loss_limit, 1, 20);
        clamp_int_field("max_positions", &mut r.max_positions, 1, 10);

        let p = &mut self.pair_trading;
        if p.z_score_entry <= 0.0 || p.z_score_entry > 10.0 {
            warn!("z_score_entry={} out of range, using default 2.0", p.z_score_entry);
            p.z_score_entry = 2.0;
        }
        if p.z_score_exit < 0.0 || p.z_score_exit >= p.z_score_entry {
            warn!("z_score_exit={} invalid, using default 0.5", p.z_score_exit);
            p.z_score_exit = 0.5;
        }
        if p.position_size_pct <= 0.0 || p.position_size_pct > 1.0 {
            warn!("position_size_pct={} out of range, using default 0.1", p.position_size_pct);
            p.position_size_pct = 0.1;
        }
        if p.max_pairs > 100 {
            warn!("max_pairs={} out of range, using default 3", p.max_pairs);
            p.max_pairs = 3;
        }

        let e = &mut self.exchange;
        if e.max_order_cost <= 0.0 {
            warn!("max_order_cost={} invalid, using default 100,000,000", e.max_order_cost);
            e.max_order_cost = 100_000_000.0;
        }
        clamp_field("balance_buffer", &mut e.balance_buffer, 0.0, 0.2);
        clamp_field("commission_rate", &mut e.commission_rate, 0.0, 0.01);
    }

    /// Strict startup validation; returns an error rather than warning
    pub fn validate(&self) -> Result<()> {
        if self.trading.pairs.is_empty() {
            bail!("config: trading.pairs must list at least one symbol");
        }
        if self.trading.initial_capital <= 0.0 {
            bail!("config: trading.initial_capital must be positive");
        }
        if !(0.0..=1.0).contains(&self.trading.min_confidence) {
            bail!("config: trading.min_confidence must be within [0, 1]");
        }
        if self.trading.trading_interval_minutes == 0 {
            bail!("config: trading.trading_interval_minutes must be at least 1");
        }
        for ratio in [
            self.strategy_allocation.trend_ratio,
            self.strategy_allocation.cointegration_ratio,
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                bail!("config: strategy_allocation ratios must be within [0, 1]");
            }
        }
        for time in [
            &self.reporting.morning_report_time,
            &self.reporting.noon_report_time,
            &self.reporting.evening_report_time,
            &self.reporting.weekly_report_time,
            &self.reporting.monthly_report_time,
        ] {
            if chrono::NaiveTime::parse_from_str(time, "%H:%M").is_err() {
                bail!("config: report time '{}' is not HH:MM", time);
            }
        }
        if self.reporting.weekly_report_day > 6 {
            bail!("config: reporting.weekly_report_day must be 0 (Mon) .. 6 (Sun)");
        }
        Ok(())
    }

    /// Rewrite the config file, keeping a timestamped backup of the previous
    /// contents. Used by the bot's `set_stop_loss` command.
    pub fn save_with_backup(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
            let backup = path.with_extension(format!("json.bak-{}", stamp));
            fs::copy(path, &backup)
                .with_context(|| format!("Failed to back up config to {}", backup.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.trading.pairs.iter().map(|p| Symbol::new(&p.symbol)).collect()
    }
}

fn clamp_field(name: &str, value: &mut f64, min: f64, max: f64) {
    let clamped = value.clamp(min, max);
    if (clamped - *value).abs() > f64::EPSILON {
        warn!("config: {} = {} out of [{}, {}], clamped to {}", name, value, min, max, clamped);
        *value = clamped;
    }
}

fn clamp_int_field(name: &str, value: &mut u32, min: u32, max: u32) {
    let clamped = (*value).clamp(min, max);
    if clamped != *value {
        warn!("config: {} = {} out of [{}, {}], clamped to {}", name, value, min, max, clamped);
        *value = clamped;
    }
}

/// One traded symbol with its share of trend-strategy capital
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPair {
    pub symbol: String,
    #[serde(default = "default_allocation")]
    pub allocation: f64,
}

fn default_allocation() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub pairs: Vec<TradingPair>,
    pub initial_capital: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_interval")]
    pub trading_interval_minutes: u64,
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskManagementConfig {
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_take_profit_first")]
    pub take_profit_first: f64,
    #[serde(default = "default_take_profit_second")]
    pub take_profit_second: f64,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_max_weekly_loss_pct")]
    pub max_weekly_loss_pct: f64,
    #[serde(default = "default_max_monthly_loss_pct")]
    pub max_monthly_loss_pct: f64,
    #[serde(default = "default_consecutive_loss_limit")]
    pub consecutive_loss_limit: u32,
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
    #[serde(default = "default_risk_per_trade_pct")]
    pub risk_per_trade_pct: f64,
    #[serde(default = "default_margin_call_threshold")]
    pub margin_call_threshold: f64,
    #[serde(default = "default_liquidation_threshold")]
    pub liquidation_threshold: f64,
}

impl Default for RiskManagementConfig {
    fn default() -> Self {
        RiskManagementConfig {
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_first: default_take_profit_first(),
            take_profit_second: default_take_profit_second(),
            max_position_size: default_max_position_size(),
            max_drawdown_pct: default_max_drawdown_pct(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_weekly_loss_pct: default_max_weekly_loss_pct(),
            max_monthly_loss_pct: default_max_monthly_loss_pct(),
            consecutive_loss_limit: default_consecutive_loss_limit(),
            max_positions: default_max_positions(),
            risk_per_trade_pct: default_risk_per_trade_pct(),
            margin_call_threshold: default_margin_call_threshold(),
            liquidation_threshold: default_liquidation_threshold(),
        }
    }
}

fn default_stop_loss_pct() -> f64 {
    10.0
}
fn default_take_profit_first() -> f64 {
    15.0
}
fn default_take_profit_second() -> f64 {
    25.0
}
fn default_max_position_size() -> f64 {
    0.95
}
fn default_max_drawdown_pct() -> f64 {
    20.0
}
fn default_max_daily_loss_pct() -> f64 {
    5.0
}
fn default_max_weekly_loss_pct() -> f64 {
    10.0
}
fn default_max_monthly_loss_pct() -> f64 {
    15.0
}
fn default_consecutive_loss_limit() -> u32 {
    5
}
fn default_max_positions() -> u32 {
    2
}
fn default_risk_per_trade_pct() -> f64 {
    2.0
}
fn default_margin_call_threshold() -> f64 {
    0.8
}
fn default_liquidation_threshold() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairTradingConfig {
    #[serde(default = "default_z_entry")]
    pub z_score_entry: f64,
    #[serde(default = "default_z_exit")]
    pub z_score_exit: f64,
    #[serde(default = "default_z_stop")]
    pub z_score_stop_loss: f64,
    #[serde(default = "default_max_pairs")]
    pub max_pairs: u32,
    #[serde(default = "default_pair_position_size_pct")]
    pub position_size_pct: f64,
    #[serde(default = "default_lookback_period")]
    pub lookback_period: u32,
    #[serde(default = "default_pair_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_pair_trailing_stop_pct")]
    pub trailing_stop_pct: f64,
    #[serde(default = "default_pair_min_profit_pct")]
    pub min_profit_pct: f64,
}

impl Default for PairTradingConfig {
    fn default() -> Self {
        PairTradingConfig {
            z_score_entry: default_z_entry(),
            z_score_exit: default_z_exit(),
            z_score_stop_loss: default_z_stop(),
            max_pairs: default_max_pairs(),
            position_size_pct: default_pair_position_size_pct(),
            lookback_period: default_lookback_period(),
            take_profit_pct: default_pair_take_profit_pct(),
            trailing_stop_pct: default_pair_trailing_stop_pct(),
            min_profit_pct: default_pair_min_profit_pct(),
        }
    }
}

fn default_z_entry() -> f64 {
    2.0
}
fn default_z_exit() -> f64 {
    0.5
}
fn default_z_stop() -> f64 {
    4.0
}
fn default_max_pairs() -> u32 {
    3
}
fn default_pair_position_size_pct() -> f64 {
    0.1
}
fn default_lookback_period() -> u32 {
    252
}
fn default_pair_take_profit_pct() -> f64 {
    0.03
}
fn default_pair_trailing_stop_pct() -> f64 {
    0.015
}
fn default_pair_min_profit_pct() -> f64 {
    0.005
}

/// Capital split between the trend and cointegration strategies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyAllocation {
    #[serde(default = "default_ratio")]
    pub trend_ratio: f64,
    #[serde(default = "default_ratio")]
    pub cointegration_ratio: f64,
}

impl Default for StrategyAllocation {
    fn default() -> Self {
        StrategyAllocation {
            trend_ratio: default_ratio(),
            cointegration_ratio: default_ratio(),
        }
    }
}

fn default_ratio() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingConfig {
    #[serde(default = "default_morning")]
    pub morning_report_time: String,
    #[serde(default = "default_noon")]
    pub noon_report_time: String,
    #[serde(default = "default_evening")]
    pub evening_report_time: String,
    /// 0 = Monday .. 6 = Sunday
    #[serde(default)]
    pub weekly_report_day: u32,
    #[serde(default = "default_evening")]
    pub weekly_report_time: String,
    #[serde(default = "default_evening")]
    pub monthly_report_time: String,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        ReportingConfig {
            morning_report_time: default_morning(),
            noon_report_time: default_noon(),
            evening_report_time: default_evening(),
            weekly_report_day: 0,
            weekly_report_time: default_evening(),
            monthly_report_time: default_evening(),
        }
    }
}

fn default_morning() -> String {
    "07:00".to_string()
}
fn default_noon() -> String {
    "13:00".to_string()
}
fn default_evening() -> String {
    "22:00".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,
    /// Safety margin on the buy-side balance pre-check
    #[serde(default = "default_balance_buffer")]
    pub balance_buffer: f64,
    /// Hard per-order notional ceiling in quote currency
    #[serde(default = "default_max_order_cost")]
    pub max_order_cost: f64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            commission_rate: default_commission_rate(),
            balance_buffer: default_balance_buffer(),
            max_order_cost: default_max_order_cost(),
        }
    }
}

fn default_commission_rate() -> f64 {
    0.0015
}
fn default_balance_buffer() -> f64 {
    0.03
}
fn default_max_order_cost() -> f64 {
    100_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config_json() -> &'static str {
        r#"{
            "trading": {
                "pairs": [{"symbol": "BTC/JPY", "allocation": 0.6}],
                "initial_capital": 200000
            },
            "risk_management": {}
        }"#
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: Config = serde_json::from_str(minimal_config_json()).unwrap();
        assert_eq!(config.trading.pairs.len(), 1);
        assert_eq!(config.trading.min_confidence, 0.6);
        assert_eq!(config.risk_management.stop_loss_pct, 10.0);
        assert_eq!(config.risk_management.take_profit_first, 15.0);
        assert_eq!(config.pair_trading.z_score_entry, 2.0);
        config.validate().unwrap();
    }

    #[test]
    fn test_unsafe_values_are_clamped() {
        let mut config: Config = serde_json::from_str(minimal_config_json()).unwrap();
        config.risk_management.stop_loss_pct = 90.0;
        config.risk_management.max_position_size = 2.0;
        config.risk_management.max_positions = 50;
        config.pair_trading.z_score_exit = 5.0;
        config.enforce_safe_ranges();

        assert_eq!(config.risk_management.stop_loss_pct, 50.0);
        assert_eq!(config.risk_management.max_position_size, 0.95);
        assert_eq!(config.risk_management.max_positions, 10);
        assert_eq!(config.pair_trading.z_score_exit, 0.5);
    }

    #[test]
    fn test_validation_rejects_empty_pairs() {
        let mut config: Config = serde_json::from_str(minimal_config_json()).unwrap();
        config.trading.pairs.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_report_time() {
        let mut config: Config = serde_json::from_str(minimal_config_json()).unwrap();
        config.reporting.morning_report_time = "7 o'clock".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_required_section_fails() {
        let result: Result<Config, _> = serde_json::from_str(r#"{"trading": {"pairs": []}}"#);
        // initial_capital and risk_management are required
        assert!(result.is_err());
    }

    #[test]
    fn test_stop_loss_round_trip() {
        let dir = std::env::temp_dir().join(format!("crypto-trader-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut config: Config = serde_json::from_str(minimal_config_json()).unwrap();
        config.risk_management.stop_loss_pct = 12.5;
        config.save_with_backup(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let reloaded: Config = serde_json::from_str(&contents).unwrap();
        assert_eq!(reloaded.risk_management.stop_loss_pct, 12.5);

        // second save leaves a backup of the first
        config.risk_management.stop_loss_pct = 8.0;
        config.save_with_backup(&path).unwrap();
        let backups: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("bak-"))
            .collect();
        assert!(!backups.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }
}
