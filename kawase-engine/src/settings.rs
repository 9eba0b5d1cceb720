//! Typed engine settings resolved from the layered configuration.

use chrono::{Duration, FixedOffset, NaiveTime, Weekday};
use rust_decimal::Decimal;

use kawase_config::{AppConfig, ConfigResult};
use kawase_core::{Pips, Price, Symbol, Volume};

/// Broker-local times at which informational checkpoints fire.
const CHECKPOINTS: [(u32, u32); 5] = [(6, 0), (8, 0), (12, 0), (16, 0), (21, 30)];

/// Safety-layer thresholds in their working units.
#[derive(Clone, Debug)]
pub struct SafetySettings {
    pub max_account_loss_pct: Decimal,
    pub hard_stop_pips: Pips,
    pub spread_alert_pips: Pips,
    pub flash_crash_pips: Pips,
    /// Layer-1 skips (and records the skip) when the last tick is older.
    pub layer1_max_tick_age: Duration,
    pub layer2_cooldown: Duration,
    pub drawdown_alert_pct: Decimal,
    pub drawdown_min_peak_pips: Pips,
    pub insurance_equity_pct: Decimal,
}

/// Everything the engine needs, parsed and validated once.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub symbol: Symbol,
    pub pip_scale: Decimal,
    pub base_lot: Volume,
    pub staleness_threshold: Duration,
    pub layer1_period: Duration,
    pub layer2a_period: Duration,
    pub layer2b_period: Duration,
    pub layer3a_period: Duration,
    pub daily_close: NaiveTime,
    pub checkpoints: Vec<NaiveTime>,
    pub weekend_start: (Weekday, NaiveTime),
    pub weekend_end: (Weekday, NaiveTime),
    pub broker_offset: FixedOffset,
    pub advisory_periodic_timeout: std::time::Duration,
    pub advisory_emergency_timeout: std::time::Duration,
    /// 60 s coalescing window for identical consecutive escalations.
    pub coalesce_window: Duration,
    pub safety: SafetySettings,
    pub initial_balance: Price,
}

impl EngineSettings {
    /// Resolve from the application configuration; any parse failure here is
    /// an invalid configuration (runner exit code 1).
    pub fn from_config(config: &AppConfig) -> ConfigResult<Self> {
        config.validate()?;
        let engine = &config.engine;
        let safety = &config.safety;
        Ok(Self {
            symbol: config.symbol.clone(),
            pip_scale: engine.pip_scale,
            base_lot: engine.base_lot,
            staleness_threshold: Duration::milliseconds(engine.tick_staleness_threshold_ms as i64),
            layer1_period: Duration::milliseconds(engine.layer1_period_ms as i64),
            layer2a_period: Duration::seconds(engine.layer2a_period_s as i64),
            layer2b_period: Duration::seconds(engine.layer2b_period_s as i64),
            layer3a_period: Duration::seconds(engine.layer3a_period_s as i64),
            daily_close: engine.daily_close()?,
            checkpoints: CHECKPOINTS
                .iter()
                .filter_map(|&(h, m)| NaiveTime::from_hms_opt(h, m, 0))
                .collect(),
            weekend_start: engine.weekend_start()?,
            weekend_end: engine.weekend_end()?,
            broker_offset: engine.broker_offset()?,
            advisory_periodic_timeout: std::time::Duration::from_millis(
                engine.advisory_timeout_periodic_ms,
            ),
            advisory_emergency_timeout: std::time::Duration::from_millis(
                engine.advisory_timeout_emergency_ms,
            ),
            coalesce_window: Duration::seconds(60),
            safety: SafetySettings {
                max_account_loss_pct: safety.max_account_loss_pct,
                hard_stop_pips: safety.hard_stop_pips,
                spread_alert_pips: safety.spread_alert_pips,
                flash_crash_pips: safety.flash_crash_pips,
                layer1_max_tick_age: Duration::seconds(1),
                layer2_cooldown: Duration::seconds(safety.layer2_cooldown_s as i64),
                drawdown_alert_pct: safety.drawdown_alert_pct,
                drawdown_min_peak_pips: safety.drawdown_min_peak_pips,
                insurance_equity_pct: safety.insurance_equity_pct,
            },
            initial_balance: config.simulation.initial_balance,
        })
    }

    /// Settings resolved from configuration defaults.
    pub fn defaults() -> Self {
        Self::from_config(&AppConfig::default()).expect("built-in defaults must be valid")
    }
}
