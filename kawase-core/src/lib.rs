//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod events;
pub mod snapshot;

pub use events::{
    CloseReason, Escalation, EscalationTrigger, EventPayload, EventRecord, Severity, Verdict,
    VerdictAction,
};
pub use snapshot::{EmaAlignment, PositionSnapshot, RecentIndicators};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for lot-volume precision.
pub type Volume = Decimal;
/// Alias for pip distances.
pub type Pips = Decimal;
/// Alias used for human-readable market symbols (e.g., `USDJPY`).
pub type Symbol = String;

/// Sequential identifier assigned to positions by the position book.
///
/// Monotonic per engine run so that same-step processing of several positions
/// has a stable total order.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct PositionId(pub u64);

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Buy the instrument.
    Buy,
    /// Sell the instrument.
    Sell,
}

impl Direction {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Signed price movement in favour of a position on this side.
    #[must_use]
    pub fn favourable_delta(self, open: Price, current: Price) -> Price {
        match self {
            Self::Buy => current - open,
            Self::Sell => open - current,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => f.write_str("BUY"),
            Self::Sell => f.write_str("SELL"),
        }
    }
}

/// Chart granularities consumed by the decision pipeline.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Timeframe {
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// All supported timeframes, finest first.
    pub const ALL: [Timeframe; 4] = [Self::M15, Self::H1, Self::H4, Self::D1];

    /// Convert the timeframe into a chrono `Duration`.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        match self {
            Self::M15 => Duration::minutes(15),
            Self::H1 => Duration::hours(1),
            Self::H4 => Duration::hours(4),
            Self::D1 => Duration::days(1),
        }
    }

    /// Number of closed bars retained per timeframe.
    #[must_use]
    pub fn window_len(self) -> usize {
        match self {
            Self::M15 => 100,
            Self::H1 => 100,
            Self::H4 => 50,
            Self::D1 => 30,
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "M15" | "15M" => Ok(Self::M15),
            "H1" | "1H" => Ok(Self::H1),
            "H4" | "4H" => Ok(Self::H4),
            "D1" | "1D" => Ok(Self::D1),
            other => Err(format!("unsupported timeframe '{other}'")),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::M15 => "M15",
            Self::H1 => "H1",
            Self::H4 => "H4",
            Self::D1 => "D1",
        };
        f.write_str(label)
    }
}

/// A single bid/ask quote update from the broker.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Tick {
    pub time: DateTime<Utc>,
    pub bid: Price,
    pub ask: Price,
    pub volume: Volume,
}

impl Tick {
    /// Mid price `(bid + ask) / 2`.
    #[must_use]
    pub fn mid(&self) -> Price {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Current spread expressed in pips for the given pip scale.
    #[must_use]
    pub fn spread_pips(&self, pip_scale: Decimal) -> Pips {
        (self.ask - self.bid) * pip_scale
    }

    /// Quotes must never be crossed.
    #[must_use]
    pub fn is_coherent(&self) -> bool {
        self.ask >= self.bid
    }
}

/// Aggregated OHLC bar data including the average spread over the bar.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OhlcBar {
    pub time: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Volume,
    pub spread: Pips,
}

impl OhlcBar {
    /// `low <= open, close <= high` and `low <= high`.
    #[must_use]
    pub fn is_coherent(&self) -> bool {
        self.low <= self.high
            && self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
    }

    /// Whether the bar closed against the given position side.
    #[must_use]
    pub fn is_adverse_for(&self, direction: Direction) -> bool {
        match direction {
            Direction::Buy => self.close < self.open,
            Direction::Sell => self.close > self.open,
        }
    }
}

/// Convert a signed price delta into pips.
#[must_use]
pub fn price_to_pips(delta: Price, pip_scale: Decimal) -> Pips {
    delta * pip_scale
}

/// Convert a pip distance back into a price delta.
#[must_use]
pub fn pips_to_price(pips: Pips, pip_scale: Decimal) -> Price {
    pips / pip_scale
}

/// MACD state for a single timeframe.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct MacdSnapshot {
    pub line: Decimal,
    pub signal: Decimal,
    pub histogram: Decimal,
}

/// Pre-computed indicator values for one timeframe.
///
/// The engine never computes indicators itself; snapshots arrive alongside
/// each bar close from the indicator source.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsi: Option<Decimal>,
    /// EMA values keyed by period (20, 50, ...).
    #[serde(default)]
    pub ema: std::collections::BTreeMap<u32, Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macd: Option<MacdSnapshot>,
    /// Close of the bar preceding the one this snapshot belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_close: Option<Price>,
}

impl IndicatorSnapshot {
    #[must_use]
    pub fn ema(&self, period: u32) -> Option<Price> {
        self.ema.get(&period).copied()
    }
}

/// Bulk indicator update covering several timeframes at once.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct IndicatorVector(pub std::collections::BTreeMap<Timeframe, IndicatorSnapshot>);

impl IndicatorVector {
    #[must_use]
    pub fn get(&self, timeframe: Timeframe) -> Option<&IndicatorSnapshot> {
        self.0.get(&timeframe)
    }
}

/// Account state reported by the broker gateway.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AccountInfo {
    pub currency: Symbol,
    pub balance: Price,
    pub equity: Price,
    pub margin_free: Price,
}

/// Immutable contract metadata for the traded symbol.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SymbolInfo {
    pub symbol: Symbol,
    /// Pip multiplier: 100 for JPY crosses, 10_000 elsewhere.
    pub pip_scale: Decimal,
    pub volume_min: Volume,
    pub volume_max: Volume,
    pub volume_step: Volume,
    /// Units of base currency per 1.0 lot.
    pub contract_size: Decimal,
}

impl SymbolInfo {
    /// Conventional USDJPY contract used throughout tests and the simulator.
    #[must_use]
    pub fn usdjpy() -> Self {
        Self {
            symbol: "USDJPY".to_string(),
            pip_scale: Decimal::from(100),
            volume_min: Decimal::new(1, 2),
            volume_max: Decimal::from(100),
            volume_step: Decimal::new(1, 2),
            contract_size: Decimal::from(100_000),
        }
    }

    /// Round a raw volume down to the broker's volume step and clamp it into
    /// the tradable range. Returns zero when the clamped volume would fall
    /// below the minimum.
    #[must_use]
    pub fn normalize_volume(&self, raw: Volume) -> Volume {
        if raw <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let stepped = if self.volume_step > Decimal::ZERO {
            (raw / self.volume_step).floor() * self.volume_step
        } else {
            raw
        };
        if stepped < self.volume_min {
            Decimal::ZERO
        } else {
            stepped.min(self.volume_max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[test]
    fn tick_mid_and_spread() {
        let tick = Tick {
            time: Utc.with_ymd_and_hms(2025, 10, 23, 12, 0, 0).unwrap(),
            bid: dec("149.598"),
            ask: dec("149.602"),
            volume: Decimal::ONE,
        };
        assert_eq!(tick.mid(), dec("149.600"));
        assert_eq!(tick.spread_pips(Decimal::from(100)), dec("0.400"));
        assert!(tick.is_coherent());
    }

    #[test]
    fn crossed_quote_is_rejected() {
        let tick = Tick {
            time: Utc::now(),
            bid: dec("149.70"),
            ask: dec("149.60"),
            volume: Decimal::ZERO,
        };
        assert!(!tick.is_coherent());
    }

    #[test]
    fn bar_coherence_bounds() {
        let mut bar = OhlcBar {
            time: Utc::now(),
            open: dec("149.60"),
            high: dec("149.70"),
            low: dec("149.50"),
            close: dec("149.65"),
            volume: Decimal::from(10),
            spread: dec("1.2"),
        };
        assert!(bar.is_coherent());
        bar.low = dec("149.66");
        assert!(!bar.is_coherent());
    }

    #[test]
    fn favourable_delta_respects_direction() {
        let open = dec("149.60");
        let current = dec("149.50");
        assert_eq!(Direction::Buy.favourable_delta(open, current), dec("-0.10"));
        assert_eq!(Direction::Sell.favourable_delta(open, current), dec("0.10"));
    }

    #[test]
    fn volume_normalization_steps_and_clamps() {
        let info = SymbolInfo::usdjpy();
        assert_eq!(info.normalize_volume(dec("0.084")), dec("0.08"));
        assert_eq!(info.normalize_volume(dec("0.004")), Decimal::ZERO);
        assert_eq!(info.normalize_volume(dec("250")), Decimal::from(100));
    }

    #[test]
    fn timeframe_windows_match_retention_policy() {
        assert_eq!(Timeframe::D1.window_len(), 30);
        assert_eq!(Timeframe::H4.window_len(), 50);
        assert_eq!(Timeframe::M15.window_len(), 100);
    }
}
