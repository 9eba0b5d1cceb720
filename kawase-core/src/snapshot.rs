//! Compact per-position snapshot handed to the advisory oracle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Direction, OhlcBar, Pips, PositionId, Price, Symbol};

/// Relationship between price and the H1 EMA pair.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmaAlignment {
    /// Price above both EMA20 and EMA50.
    Bullish,
    /// Price below both.
    Bearish,
    /// Price between the two averages.
    Mixed,
    Unknown,
}

/// The indicator subset the oracle cares about.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RecentIndicators {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsi_h1: Option<Decimal>,
    pub ema_h1_alignment: EmaAlignment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macd_h1_histogram: Option<Decimal>,
}

/// Wire-stable position snapshot sent on every periodic or emergency review.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PositionSnapshot {
    pub position_id: PositionId,
    pub symbol: Symbol,
    pub direction: Direction,
    pub open_price: Price,
    pub open_time: DateTime<Utc>,
    pub current_price: Price,
    pub unrealized_pips: Pips,
    pub unrealized_pct: Decimal,
    pub holding_minutes: i64,
    pub recent_indicators: RecentIndicators,
    /// The three most recent closed M15 bars, oldest first.
    pub last_bars_m15: Vec<OhlcBar>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn snapshot_serializes_with_declared_field_order() {
        let snapshot = PositionSnapshot {
            position_id: PositionId(3),
            symbol: "USDJPY".into(),
            direction: Direction::Sell,
            open_price: "149.80".parse().unwrap(),
            open_time: Utc.with_ymd_and_hms(2025, 10, 23, 9, 30, 0).unwrap(),
            current_price: "149.62".parse().unwrap(),
            unrealized_pips: "18".parse().unwrap(),
            unrealized_pct: "0.12".parse().unwrap(),
            holding_minutes: 150,
            recent_indicators: RecentIndicators {
                rsi_h1: Some("41.5".parse().unwrap()),
                ema_h1_alignment: EmaAlignment::Bearish,
                macd_h1_histogram: None,
            },
            last_bars_m15: Vec::new(),
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.starts_with(r#"{"position_id":3,"symbol":"USDJPY","direction":"SELL""#));
        assert!(json.contains(r#""ema_h1_alignment":"bearish""#));
    }
}
