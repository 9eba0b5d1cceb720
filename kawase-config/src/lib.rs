//! Layered configuration loading utilities.

use std::path::Path;

use chrono::{FixedOffset, NaiveTime, Weekday};
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

/// Result alias for configuration handling.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Failures that make the configuration unusable (runner exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("'{field}' is not a valid HH:MM time: {value}")]
    BadTime { field: &'static str, value: String },
    #[error("'{field}' is not a valid 'DDD HH:MM' boundary: {value}")]
    BadBoundary { field: &'static str, value: String },
    #[error("broker_utc_offset_hours {0} is outside [-12, 14]")]
    BadOffset(i32),
    #[error("'{field}' must be positive (got {value})")]
    NonPositive { field: &'static str, value: String },
}

/// Root application configuration deserialized from layered sources.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            log_level: default_log_level(),
            engine: EngineConfig::default(),
            safety: SafetyConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Validate every parsed-on-demand field once, up front.
    pub fn validate(&self) -> ConfigResult<()> {
        self.engine.validate()
    }
}

/// Cadences, sizing and schedule boundaries of the decision pipeline.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_base_lot")]
    pub base_lot: Decimal,
    #[serde(default = "default_pip_scale")]
    pub pip_scale: Decimal,
    #[serde(default = "default_layer1_period_ms")]
    pub layer1_period_ms: u64,
    #[serde(default = "default_layer2a_period_s")]
    pub layer2a_period_s: u64,
    #[serde(default = "default_layer2b_period_s")]
    pub layer2b_period_s: u64,
    #[serde(default = "default_layer3a_period_s")]
    pub layer3a_period_s: u64,
    #[serde(default = "default_daily_close")]
    pub daily_close_hhmm: String,
    #[serde(default = "default_staleness_ms")]
    pub tick_staleness_threshold_ms: u64,
    #[serde(default = "default_advisory_periodic_ms")]
    pub advisory_timeout_periodic_ms: u64,
    #[serde(default = "default_advisory_emergency_ms")]
    pub advisory_timeout_emergency_ms: u64,
    #[serde(default = "default_weekend_start")]
    pub weekend_start: String,
    #[serde(default = "default_weekend_end")]
    pub weekend_end: String,
    /// Fixed offset of the broker server clock from UTC, in hours.
    #[serde(default = "default_broker_offset_hours")]
    pub broker_utc_offset_hours: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_lot: default_base_lot(),
            pip_scale: default_pip_scale(),
            layer1_period_ms: default_layer1_period_ms(),
            layer2a_period_s: default_layer2a_period_s(),
            layer2b_period_s: default_layer2b_period_s(),
            layer3a_period_s: default_layer3a_period_s(),
            daily_close_hhmm: default_daily_close(),
            tick_staleness_threshold_ms: default_staleness_ms(),
            advisory_timeout_periodic_ms: default_advisory_periodic_ms(),
            advisory_timeout_emergency_ms: default_advisory_emergency_ms(),
            weekend_start: default_weekend_start(),
            weekend_end: default_weekend_end(),
            broker_utc_offset_hours: default_broker_offset_hours(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.base_lot <= Decimal::ZERO {
            return Err(ConfigError::NonPositive {
                field: "base_lot",
                value: self.base_lot.to_string(),
            });
        }
        if self.pip_scale <= Decimal::ZERO {
            return Err(ConfigError::NonPositive {
                field: "pip_scale",
                value: self.pip_scale.to_string(),
            });
        }
        self.daily_close()?;
        self.weekend_start()?;
        self.weekend_end()?;
        self.broker_offset()?;
        Ok(())
    }

    /// Broker-local daily force-close time.
    pub fn daily_close(&self) -> ConfigResult<NaiveTime> {
        parse_hhmm("daily_close_hhmm", &self.daily_close_hhmm)
    }

    pub fn weekend_start(&self) -> ConfigResult<(Weekday, NaiveTime)> {
        parse_boundary("weekend_start", &self.weekend_start)
    }

    pub fn weekend_end(&self) -> ConfigResult<(Weekday, NaiveTime)> {
        parse_boundary("weekend_end", &self.weekend_end)
    }

    pub fn broker_offset(&self) -> ConfigResult<FixedOffset> {
        let hours = self.broker_utc_offset_hours;
        if !(-12..=14).contains(&hours) {
            return Err(ConfigError::BadOffset(hours));
        }
        FixedOffset::east_opt(hours * 3600).ok_or(ConfigError::BadOffset(hours))
    }
}

/// Thresholds of the three safety-monitor layers.
#[derive(Clone, Debug, Deserialize)]
pub struct SafetyConfig {
    /// Layer-1: fraction of equity-at-open whose loss forces a close.
    #[serde(default = "default_account_loss_pct")]
    pub max_account_loss_pct: Decimal,
    #[serde(default = "default_hard_stop_pips")]
    pub hard_stop_pips: Decimal,
    #[serde(default = "default_spread_alert_pips")]
    pub spread_alert_pips: Decimal,
    #[serde(default = "default_flash_crash_pips")]
    pub flash_crash_pips: Decimal,
    /// Layer-2: suppression window for repeated identical escalations.
    #[serde(default = "default_layer2_cooldown_s")]
    pub layer2_cooldown_s: u64,
    /// Layer-2: retrace fraction of the peak that raises a drawdown alert.
    #[serde(default = "default_drawdown_alert_pct")]
    pub drawdown_alert_pct: Decimal,
    #[serde(default = "default_drawdown_min_peak_pips")]
    pub drawdown_min_peak_pips: Decimal,
    /// Insurance stop: fraction of equity protected by the backstop.
    #[serde(default = "default_insurance_equity_pct")]
    pub insurance_equity_pct: Decimal,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_account_loss_pct: default_account_loss_pct(),
            hard_stop_pips: default_hard_stop_pips(),
            spread_alert_pips: default_spread_alert_pips(),
            flash_crash_pips: default_flash_crash_pips(),
            layer2_cooldown_s: default_layer2_cooldown_s(),
            drawdown_alert_pct: default_drawdown_alert_pct(),
            drawdown_min_peak_pips: default_drawdown_min_peak_pips(),
            insurance_equity_pct: default_insurance_equity_pct(),
        }
    }
}

/// Fill friction applied by the simulated gateway.
#[derive(Clone, Debug, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    #[serde(default)]
    pub slippage_pips: Decimal,
    #[serde(default)]
    pub commission_per_lot: Decimal,
    #[serde(default)]
    pub swap_per_lot_per_day: Decimal,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            slippage_pips: Decimal::ZERO,
            commission_per_lot: Decimal::ZERO,
            swap_per_lot_per_day: Decimal::ZERO,
        }
    }
}

fn parse_hhmm(field: &'static str, value: &str) -> ConfigResult<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| ConfigError::BadTime {
        field,
        value: value.to_string(),
    })
}

fn parse_boundary(field: &'static str, value: &str) -> ConfigResult<(Weekday, NaiveTime)> {
    let bad = || ConfigError::BadBoundary {
        field,
        value: value.to_string(),
    };
    let mut parts = value.split_whitespace();
    let day = parts.next().ok_or_else(bad)?;
    let time = parts.next().ok_or_else(bad)?;
    if parts.next().is_some() {
        return Err(bad());
    }
    let weekday = match day.to_ascii_uppercase().as_str() {
        "MON" => Weekday::Mon,
        "TUE" => Weekday::Tue,
        "WED" => Weekday::Wed,
        "THU" => Weekday::Thu,
        "FRI" => Weekday::Fri,
        "SAT" => Weekday::Sat,
        "SUN" => Weekday::Sun,
        _ => return Err(bad()),
    };
    let time = NaiveTime::parse_from_str(time, "%H:%M").map_err(|_| bad())?;
    Ok((weekday, time))
}

fn default_symbol() -> String {
    "USDJPY".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_lot() -> Decimal {
    Decimal::new(1, 1)
}

fn default_pip_scale() -> Decimal {
    Decimal::from(100)
}

fn default_layer1_period_ms() -> u64 {
    100
}

fn default_layer2a_period_s() -> u64 {
    60
}

fn default_layer2b_period_s() -> u64 {
    300
}

fn default_layer3a_period_s() -> u64 {
    900
}

fn default_daily_close() -> String {
    "23:00".to_string()
}

fn default_staleness_ms() -> u64 {
    10_000
}

fn default_advisory_periodic_ms() -> u64 {
    3_000
}

fn default_advisory_emergency_ms() -> u64 {
    10_000
}

fn default_weekend_start() -> String {
    "FRI 23:00".to_string()
}

fn default_weekend_end() -> String {
    "MON 07:00".to_string()
}

fn default_broker_offset_hours() -> i32 {
    2
}

fn default_account_loss_pct() -> Decimal {
    Decimal::new(2, 2)
}

fn default_hard_stop_pips() -> Decimal {
    Decimal::from(50)
}

fn default_spread_alert_pips() -> Decimal {
    Decimal::from(20)
}

fn default_flash_crash_pips() -> Decimal {
    Decimal::from(30)
}

fn default_layer2_cooldown_s() -> u64 {
    600
}

fn default_drawdown_alert_pct() -> Decimal {
    Decimal::from(10)
}

fn default_drawdown_min_peak_pips() -> Decimal {
    Decimal::from(5)
}

fn default_insurance_equity_pct() -> Decimal {
    Decimal::new(5, 2)
}

fn default_initial_balance() -> Decimal {
    Decimal::from(1_000_000)
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `KAWASE_`
pub fn load_config(env: Option<&str>) -> anyhow::Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }
    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));
    builder = builder.add_source(
        Environment::with_prefix("KAWASE")
            .separator("__")
            .ignore_empty(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}
