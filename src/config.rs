//! Configuration
//!
//! Layered load: `config.toml`, then a `config.local.toml` deep overlay, then
//! environment overrides for sensitive values. The result is immutable for
//! the life of the process except for the two runtime-tunable knobs, which
//! live behind a read-write lock.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    Simulation,
    Backtest,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Simulation
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VenueConfig {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
    pub testnet: bool,
    pub enabled: bool,
    pub arbitrage_enabled: bool,
    pub region: String,
    pub maker_fee: f64,
    pub taker_fee: f64,
    /// Symbols known to break this venue's subscriptions; filtered before
    /// subscribing.
    pub deny_symbols: Vec<String>,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            passphrase: None,
            testnet: false,
            enabled: true,
            arbitrage_enabled: true,
            region: "global".to_string(),
            maker_fee: 0.001,
            taker_fee: 0.001,
            deny_symbols: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrageConfig {
    /// Fraction, e.g. 0.001 = 0.1%.
    pub min_profit_threshold: f64,
    /// USD cap on a single position.
    pub max_position_size: f64,
    pub max_trades_per_hour: usize,
    pub trade_amount_usd: f64,
    pub max_symbols: usize,
    pub slippage_tolerance: f64,
    pub max_spread_age_seconds: f64,
    /// Spreads above this fraction are treated as feed anomalies.
    pub max_spread_threshold: f64,
    pub enabled_quote_currencies: Vec<String>,
    pub moving_average_periods: usize,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            min_profit_threshold: 0.001,
            max_position_size: 1000.0,
            max_trades_per_hour: 50,
            trade_amount_usd: 100.0,
            max_symbols: 200,
            slippage_tolerance: 0.001,
            max_spread_age_seconds: 5.0,
            max_spread_threshold: 2.0,
            enabled_quote_currencies: vec!["USDT".to_string()],
            moving_average_periods: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PremiumDetectionConfig {
    pub enabled: bool,
    pub lookback_periods: usize,
    pub min_samples: usize,
    pub outlier_threshold: f64,
}

impl Default for PremiumDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_periods: 100,
            min_samples: 50,
            outlier_threshold: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_drawdown_percent: f64,
    pub stop_loss_percent: f64,
    pub max_concurrent_trades: usize,
    pub balance_threshold_percent: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_percent: 5.0,
            stop_loss_percent: 2.0,
            max_concurrent_trades: 3,
            balance_threshold_percent: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub path: String,
    pub backup_interval_hours: u64,
    pub max_history_days: i64,
    /// Quote batch flush size.
    pub batch_size: usize,
    /// Quote batch flush interval and per-(venue,symbol) write gate.
    pub batch_interval_seconds: f64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: "data/arbx.db".to_string(),
            backup_interval_hours: 24,
            max_history_days: 30,
            batch_size: 100,
            batch_interval_seconds: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BacktestDataSource {
    Database,
    Csv,
}

impl Default for BacktestDataSource {
    fn default() -> Self {
        Self::Database
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// YYYY-MM-DD.
    pub start_date: String,
    pub end_date: String,
    pub initial_balance: f64,
    pub data_source: BacktestDataSource,
    pub csv_path: Option<String>,
    /// Simulator RNG seed; fixed so replays are reproducible.
    pub seed: u64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            start_date: "2024-01-01".to_string(),
            end_date: "2024-12-31".to_string(),
            initial_balance: 10000.0,
            data_source: BacktestDataSource::Database,
            csv_path: None,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub trading_mode: TradingMode,
    /// Keyed by venue name; BTreeMap keeps iteration order deterministic.
    pub venues: BTreeMap<String, VenueConfig>,
    pub arbitrage: ArbitrageConfig,
    pub premium_detection: PremiumDetectionConfig,
    pub risk: RiskConfig,
    pub persistence: PersistenceConfig,
    pub backtest: BacktestConfig,
}

impl Config {
    /// Load `path`, overlay `<stem>.local.toml` if present, then apply
    /// environment overrides. A missing main file yields defaults, so a
    /// fresh checkout can still run in simulation mode.
    pub fn load(path: &str) -> Result<Self> {
        let mut merged = read_toml(path)?.unwrap_or(toml::Value::Table(Default::default()));

        let local_path = path.replace(".toml", ".local.toml");
        if let Some(overlay) = read_toml(&local_path)? {
            deep_merge(&mut merged, overlay);
        }

        let mut config: Config = merged
            .try_into()
            .with_context(|| format!("invalid configuration in {}", path))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Sensitive values come from the environment and win over file values,
    /// preserving the venue's non-sensitive fields.
    fn apply_env_overrides(&mut self) {
        for (name, venue) in self.venues.iter_mut() {
            let prefix = name.to_uppercase();
            if let Ok(key) = env::var(format!("{}_API_KEY", prefix)) {
                venue.api_key = key;
            }
            if let Ok(secret) = env::var(format!("{}_API_SECRET", prefix)) {
                venue.api_secret = secret;
            }
            if let Ok(testnet) = env::var(format!("{}_TESTNET", prefix)) {
                venue.testnet = matches!(testnet.to_lowercase().as_str(), "1" | "true" | "on");
            }
        }

        if let Ok(mode) = env::var("TRADING_MODE") {
            match mode.to_lowercase().as_str() {
                "live" => self.trading_mode = TradingMode::Live,
                "simulation" => self.trading_mode = TradingMode::Simulation,
                "backtest" => self.trading_mode = TradingMode::Backtest,
                _ => {}
            }
        }

        if let Ok(path) = env::var("DATABASE_PATH") {
            self.persistence.path = path;
        }
    }

    pub fn enabled_venues(&self) -> Vec<String> {
        self.venues
            .iter()
            .filter(|(_, v)| v.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn arbitrage_venues(&self) -> Vec<String> {
        self.venues
            .iter()
            .filter(|(_, v)| v.enabled && v.arbitrage_enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Collect every validation failure; the process aborts at startup when
    /// any are present.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.venues.is_empty() {
            errors.push("no venues configured".to_string());
        }

        if self.arbitrage_venues().len() < 2 && self.trading_mode != TradingMode::Backtest {
            errors.push("at least 2 venues must be enabled for arbitrage".to_string());
        }

        if self.trading_mode == TradingMode::Live {
            for (name, venue) in &self.venues {
                if venue.enabled && venue.api_key.is_empty() {
                    errors.push(format!("API key missing for {}", name));
                }
                if venue.enabled && venue.api_secret.is_empty() {
                    errors.push(format!("API secret missing for {}", name));
                }
            }
        }

        if self.arbitrage.min_profit_threshold <= 0.0 {
            errors.push("arbitrage.min_profit_threshold must be positive".to_string());
        }
        if self.arbitrage.max_spread_threshold <= self.arbitrage.min_profit_threshold {
            errors.push("arbitrage.max_spread_threshold must exceed min_profit_threshold".to_string());
        }
        if self.arbitrage.trade_amount_usd <= 0.0 {
            errors.push("arbitrage.trade_amount_usd must be positive".to_string());
        }
        if self.arbitrage.max_spread_age_seconds <= 0.0 {
            errors.push("arbitrage.max_spread_age_seconds must be positive".to_string());
        }
        if self.arbitrage.enabled_quote_currencies.is_empty() {
            errors.push("arbitrage.enabled_quote_currencies must not be empty".to_string());
        }
        for (name, venue) in &self.venues {
            for fee in [venue.maker_fee, venue.taker_fee] {
                if !(0.0..1.0).contains(&fee) {
                    errors.push(format!("fees for {} must be in [0, 1)", name));
                    break;
                }
            }
        }

        if self.trading_mode == TradingMode::Backtest {
            for (label, date) in [
                ("backtest.start_date", &self.backtest.start_date),
                ("backtest.end_date", &self.backtest.end_date),
            ] {
                if chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
                    errors.push(format!("{} is not a valid YYYY-MM-DD date", label));
                }
            }
            if self.backtest.data_source == BacktestDataSource::Csv
                && self.backtest.csv_path.is_none()
            {
                errors.push("backtest.csv_path required when data_source = \"csv\"".to_string());
            }
        }

        errors
    }
}

fn read_toml(path: &str) -> Result<Option<toml::Value>> {
    if !Path::new(path).exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let value = raw
        .parse::<toml::Value>()
        .with_context(|| format!("parsing {}", path))?;
    Ok(Some(value))
}

/// Recursive table merge; overlay wins on leaf conflicts.
fn deep_merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

/// Knobs adjustable while the engine runs. Readers take the lock for a copy;
/// writers are rare (operator actions).
#[derive(Debug)]
pub struct Tunables {
    inner: RwLock<TunableValues>,
}

#[derive(Debug, Clone, Copy)]
pub struct TunableValues {
    pub min_profit_threshold: f64,
    pub trade_amount_usd: f64,
}

impl Tunables {
    pub fn new(arbitrage: &ArbitrageConfig) -> Self {
        Self {
            inner: RwLock::new(TunableValues {
                min_profit_threshold: arbitrage.min_profit_threshold,
                trade_amount_usd: arbitrage.trade_amount_usd,
            }),
        }
    }

    pub fn get(&self) -> TunableValues {
        *self.inner.read()
    }

    pub fn set_min_profit_threshold(&self, value: f64) {
        self.inner.write().min_profit_threshold = value;
    }

    pub fn set_trade_amount_usd(&self, value: f64) {
        self.inner.write().trade_amount_usd = value;
    }
}
