//! Builders shared by the unit tests in this crate.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::json;

use kawase_core::{IndicatorSnapshot, MacdSnapshot, OhlcBar, Tick};
use kawase_market::MarketView;
use kawase_rules::StructuredRule;

use crate::book::{OpenParams, PositionBook};
use kawase_core::{Direction, PositionId};

pub fn dec(value: &str) -> Decimal {
    value.parse().unwrap()
}

/// Thursday 2025-10-23 09:00 UTC.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 23, 9, 0, 0).unwrap()
}

pub fn tick(offset_ms: i64, bid: &str, ask: &str) -> Tick {
    Tick {
        time: t0() + Duration::milliseconds(offset_ms),
        bid: dec(bid),
        ask: dec(ask),
        volume: Decimal::ONE,
    }
}

pub fn bar(offset_min: i64, open: &str, high: &str, low: &str, close: &str) -> OhlcBar {
    OhlcBar {
        time: t0() + Duration::minutes(offset_min),
        open: dec(open),
        high: dec(high),
        low: dec(low),
        close: dec(close),
        volume: Decimal::from(10),
        spread: dec("1"),
    }
}

/// Baseline BUY rule: zone [149.50, 149.65], ladder 10/20/30 pips closing
/// 30/40/30 percent, 15-pip stop.
pub fn rule_json() -> serde_json::Value {
    json!({
        "version": 1,
        "generated_at": "2025-10-23T09:00:00Z",
        "valid_until": "2025-10-23T10:00:00Z",
        "symbol": "USDJPY",
        "daily_bias": "BUY",
        "confidence": "0.7",
        "entry_conditions": {
            "should_trade": true,
            "direction": "BUY",
            "price_zone": {"min": "149.50", "max": "149.65"},
            "spread": {"max_pips": "3"}
        },
        "exit_strategy": {
            "take_profit": [
                {"pips": "10", "close_percent": "30"},
                {"pips": "20", "close_percent": "40"},
                {"pips": "30", "close_percent": "30"}
            ],
            "stop_loss": {"initial_pips": "15"}
        },
        "risk_management": {
            "position_size_multiplier": "0.8",
            "max_positions": 2,
            "max_risk_per_trade_percent": "1",
            "max_total_exposure_percent": "5"
        },
        "key_levels": {}
    })
}

pub fn rule_with(mutate: impl FnOnce(&mut serde_json::Value)) -> StructuredRule {
    let mut raw = rule_json();
    mutate(&mut raw);
    StructuredRule::from_json(&raw.to_string()).expect("test rule must parse")
}

pub fn rule() -> StructuredRule {
    rule_with(|_| {})
}

pub fn view() -> MarketView {
    MarketView::new("USDJPY", dec("100"), Duration::seconds(10))
}

pub fn view_with_tick(bid: &str, ask: &str) -> MarketView {
    let mut view = view();
    view.update_tick(tick(0, bid, ask)).unwrap();
    view
}

pub fn snapshot(rsi: Option<&str>, ema20: Option<&str>, ema50: Option<&str>) -> IndicatorSnapshot {
    let mut snapshot = IndicatorSnapshot::default();
    snapshot.rsi = rsi.map(dec);
    if let Some(value) = ema20 {
        snapshot.ema.insert(20, dec(value));
    }
    if let Some(value) = ema50 {
        snapshot.ema.insert(50, dec(value));
    }
    snapshot
}

pub fn macd(line: &str, signal: &str) -> MacdSnapshot {
    let line = dec(line);
    let signal = dec(signal);
    MacdSnapshot {
        line,
        signal,
        histogram: line - signal,
    }
}

/// Open one BUY position at 149.60 on 0.10 lots through the book.
pub fn open_buy(book: &mut PositionBook, rule: StructuredRule) -> PositionId {
    book.open_position(OpenParams {
        symbol: "USDJPY".into(),
        direction: Direction::Buy,
        opened_at: t0(),
        open_price: dec("149.60"),
        volume: dec("0.10"),
        insurance_sl: dec("149.10"),
        placed_sl: dec("149.45"),
        equity_at_open: dec("1000000"),
        rule_snapshot: Arc::new(rule),
    })
    .id
}
