//! Immutable most-recent market snapshot: latest tick, per-timeframe OHLC
//! windows and pre-computed indicator vectors.
//!
//! There is exactly one writer (the ingest path on the engine loop); readers
//! always observe the state left by the last completed update.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::warn;

use kawase_core::{IndicatorSnapshot, IndicatorVector, OhlcBar, Pips, Price, Symbol, Tick, Timeframe};

/// How long the flash-crash price memory reaches back.
const MID_MEMORY: Duration = Duration::seconds(2);

/// Result alias for market-view updates.
pub type MarketResult<T> = Result<T, MarketError>;

/// Boundary failures on ingested market data.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("crossed quote at {time}: bid {bid} > ask {ask}")]
    CrossedQuote {
        time: DateTime<Utc>,
        bid: Price,
        ask: Price,
    },
    #[error("incoherent bar at {time}")]
    IncoherentBar { time: DateTime<Utc> },
}

/// Freshness of the last tick relative to the staleness threshold.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Staleness {
    Fresh,
    /// Entries must be suppressed; the emergency layer still runs on any
    /// tick that does arrive.
    Stale,
}

/// What happened to an offered tick.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TickOutcome {
    Applied,
    /// Same `(time, bid, ask)` as the stored tick; ingestion is idempotent.
    Duplicate,
    /// Older than the stored tick; dropped.
    OutOfOrder,
}

/// What happened to an offered bar.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BarOutcome {
    Appended,
    /// Same open time as the trailing bar: the unclosed bar was rewritten.
    Rewrote,
    OutOfOrder,
}

#[derive(Clone, Debug, Default)]
struct TimeframeIndicators {
    current: IndicatorSnapshot,
    previous: Option<IndicatorSnapshot>,
}

/// Process-wide market snapshot for one symbol.
pub struct MarketView {
    symbol: Symbol,
    pip_scale: Decimal,
    staleness_threshold: Duration,
    tick: Option<Tick>,
    recent_mids: VecDeque<(DateTime<Utc>, Price)>,
    bars: BTreeMap<Timeframe, VecDeque<OhlcBar>>,
    indicators: BTreeMap<Timeframe, TimeframeIndicators>,
}

impl MarketView {
    pub fn new(symbol: impl Into<Symbol>, pip_scale: Decimal, staleness_threshold: Duration) -> Self {
        let mut bars = BTreeMap::new();
        for timeframe in Timeframe::ALL {
            bars.insert(timeframe, VecDeque::with_capacity(timeframe.window_len()));
        }
        Self {
            symbol: symbol.into(),
            pip_scale,
            staleness_threshold,
            tick: None,
            recent_mids: VecDeque::new(),
            bars,
            indicators: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[must_use]
    pub fn pip_scale(&self) -> Decimal {
        self.pip_scale
    }

    /// Atomically replace the current tick.
    ///
    /// Duplicates are idempotent; out-of-order ticks are dropped and logged.
    pub fn update_tick(&mut self, tick: Tick) -> MarketResult<TickOutcome> {
        if !tick.is_coherent() {
            return Err(MarketError::CrossedQuote {
                time: tick.time,
                bid: tick.bid,
                ask: tick.ask,
            });
        }
        if let Some(stored) = &self.tick {
            if stored.time == tick.time && stored.bid == tick.bid && stored.ask == tick.ask {
                return Ok(TickOutcome::Duplicate);
            }
            if tick.time < stored.time {
                warn!(
                    symbol = %self.symbol,
                    stored = %stored.time,
                    received = %tick.time,
                    "dropping out-of-order tick"
                );
                return Ok(TickOutcome::OutOfOrder);
            }
        }
        let cutoff = tick.time - MID_MEMORY;
        while self
            .recent_mids
            .front()
            .is_some_and(|(time, _)| *time < cutoff)
        {
            self.recent_mids.pop_front();
        }
        self.recent_mids.push_back((tick.time, tick.mid()));
        self.tick = Some(tick);
        Ok(TickOutcome::Applied)
    }

    /// Append a bar, or rewrite the trailing unclosed bar when the open time
    /// matches. Windows evict to the configured per-timeframe length.
    pub fn update_bars(&mut self, timeframe: Timeframe, bar: OhlcBar) -> MarketResult<BarOutcome> {
        if !bar.is_coherent() {
            return Err(MarketError::IncoherentBar { time: bar.time });
        }
        let window = self.bars.entry(timeframe).or_default();
        if let Some(last) = window.back() {
            if bar.time == last.time {
                *window.back_mut().expect("window is non-empty") = bar;
                return Ok(BarOutcome::Rewrote);
            }
            if bar.time < last.time {
                warn!(symbol = %self.symbol, %timeframe, time = %bar.time, "dropping out-of-order bar");
                return Ok(BarOutcome::OutOfOrder);
            }
        }
        window.push_back(bar);
        while window.len() > timeframe.window_len() {
            window.pop_front();
        }
        Ok(BarOutcome::Appended)
    }

    /// Bulk-replace indicator state; each covered timeframe's current
    /// snapshot rotates into the previous slot.
    pub fn update_indicators(&mut self, vector: IndicatorVector) {
        for (timeframe, snapshot) in vector.0 {
            self.update_timeframe_indicators(timeframe, snapshot);
        }
    }

    /// Replace one timeframe's indicator snapshot, rotating the old one.
    pub fn update_timeframe_indicators(&mut self, timeframe: Timeframe, snapshot: IndicatorSnapshot) {
        let entry = self.indicators.entry(timeframe).or_default();
        let old = std::mem::replace(&mut entry.current, snapshot);
        entry.previous = Some(old);
    }

    #[must_use]
    pub fn tick(&self) -> Option<&Tick> {
        self.tick.as_ref()
    }

    #[must_use]
    pub fn mid(&self) -> Option<Price> {
        self.tick.as_ref().map(Tick::mid)
    }

    #[must_use]
    pub fn spread_pips(&self) -> Option<Pips> {
        self.tick.as_ref().map(|tick| tick.spread_pips(self.pip_scale))
    }

    /// Age-based freshness; with no tick at all the view is stale.
    #[must_use]
    pub fn staleness(&self, now: DateTime<Utc>) -> Staleness {
        match &self.tick {
            Some(tick) if now - tick.time <= self.staleness_threshold => Staleness::Fresh,
            _ => Staleness::Stale,
        }
    }

    #[must_use]
    pub fn last_tick_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.tick.as_ref().map(|tick| now - tick.time)
    }

    #[must_use]
    pub fn bars(&self, timeframe: Timeframe) -> Option<&VecDeque<OhlcBar>> {
        self.bars.get(&timeframe)
    }

    /// The `count` most recent bars, oldest first.
    #[must_use]
    pub fn recent_bars(&self, timeframe: Timeframe, count: usize) -> Vec<&OhlcBar> {
        let Some(window) = self.bars.get(&timeframe) else {
            return Vec::new();
        };
        let skip = window.len().saturating_sub(count);
        window.iter().skip(skip).collect()
    }

    #[must_use]
    pub fn latest_bar(&self, timeframe: Timeframe) -> Option<&OhlcBar> {
        self.bars.get(&timeframe).and_then(VecDeque::back)
    }

    #[must_use]
    pub fn indicators(&self, timeframe: Timeframe) -> Option<&IndicatorSnapshot> {
        self.indicators.get(&timeframe).map(|entry| &entry.current)
    }

    #[must_use]
    pub fn previous_indicators(&self, timeframe: Timeframe) -> Option<&IndicatorSnapshot> {
        self.indicators
            .get(&timeframe)
            .and_then(|entry| entry.previous.as_ref())
    }

    /// Most recent recorded mid at least `age` older than `at`. Used for the
    /// flash-crash check; `None` until enough price memory has accumulated.
    #[must_use]
    pub fn mid_at_least_ago(&self, at: DateTime<Utc>, age: Duration) -> Option<Price> {
        let cutoff = at - age;
        self.recent_mids
            .iter()
            .rev()
            .find(|(time, _)| *time <= cutoff)
            .map(|(_, mid)| *mid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    fn at(ms: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 23, 12, 0, 0).unwrap() + Duration::milliseconds(i64::from(ms))
    }

    fn tick(ms: u32, bid: &str, ask: &str) -> Tick {
        Tick {
            time: at(ms),
            bid: dec(bid),
            ask: dec(ask),
            volume: Decimal::ONE,
        }
    }

    fn view() -> MarketView {
        MarketView::new("USDJPY", Decimal::from(100), Duration::seconds(10))
    }

    fn bar(minute: u32, close: &str) -> OhlcBar {
        let time = Utc.with_ymd_and_hms(2025, 10, 23, 9, 0, 0).unwrap()
            + Duration::minutes(i64::from(minute));
        OhlcBar {
            time,
            open: dec("149.50"),
            high: dec("149.80"),
            low: dec("149.40"),
            close: dec(close),
            volume: Decimal::from(10),
            spread: dec("1"),
        }
    }

    #[test]
    fn duplicate_tick_is_idempotent() {
        let mut view = view();
        assert_eq!(
            view.update_tick(tick(0, "149.59", "149.61")).unwrap(),
            TickOutcome::Applied
        );
        assert_eq!(
            view.update_tick(tick(0, "149.59", "149.61")).unwrap(),
            TickOutcome::Duplicate
        );
    }

    #[test]
    fn out_of_order_tick_is_dropped() {
        let mut view = view();
        view.update_tick(tick(500, "149.59", "149.61")).unwrap();
        assert_eq!(
            view.update_tick(tick(100, "149.58", "149.60")).unwrap(),
            TickOutcome::OutOfOrder
        );
        assert_eq!(view.mid().unwrap(), dec("149.60"));
    }

    #[test]
    fn crossed_quote_is_an_error() {
        let mut view = view();
        assert!(view.update_tick(tick(0, "149.70", "149.60")).is_err());
        assert!(view.tick().is_none());
    }

    #[test]
    fn staleness_follows_threshold() {
        let mut view = view();
        view.update_tick(tick(0, "149.59", "149.61")).unwrap();
        assert_eq!(view.staleness(at(5_000)), Staleness::Fresh);
        assert_eq!(view.staleness(at(10_000)), Staleness::Fresh);
        assert_eq!(view.staleness(at(10_001)), Staleness::Stale);
    }

    #[test]
    fn empty_view_is_stale() {
        assert_eq!(view().staleness(at(0)), Staleness::Stale);
    }

    #[test]
    fn trailing_bar_rewrite_keeps_window_length() {
        let mut view = view();
        assert_eq!(
            view.update_bars(Timeframe::M15, bar(0, "149.55")).unwrap(),
            BarOutcome::Appended
        );
        assert_eq!(
            view.update_bars(Timeframe::M15, bar(0, "149.62")).unwrap(),
            BarOutcome::Rewrote
        );
        assert_eq!(view.bars(Timeframe::M15).unwrap().len(), 1);
        assert_eq!(view.latest_bar(Timeframe::M15).unwrap().close, dec("149.62"));
    }

    #[test]
    fn bar_window_evicts_to_configured_length() {
        let mut view = view();
        for idx in 0..120 {
            view.update_bars(Timeframe::M15, bar(idx * 15, "149.55"))
                .unwrap();
        }
        assert_eq!(view.bars(Timeframe::M15).unwrap().len(), 100);
    }

    #[test]
    fn indicator_rotation_keeps_previous_snapshot() {
        let mut view = view();
        let mut first = IndicatorSnapshot::default();
        first.rsi = Some(dec("55"));
        let mut second = IndicatorSnapshot::default();
        second.rsi = Some(dec("61"));

        view.update_timeframe_indicators(Timeframe::M15, first);
        view.update_timeframe_indicators(Timeframe::M15, second);

        assert_eq!(view.indicators(Timeframe::M15).unwrap().rsi, Some(dec("61")));
        assert_eq!(
            view.previous_indicators(Timeframe::M15).unwrap().rsi,
            Some(dec("55"))
        );
    }

    #[test]
    fn flash_crash_lookback_finds_prices_at_least_that_old() {
        let mut view = view();
        view.update_tick(tick(0, "149.59", "149.61")).unwrap();
        view.update_tick(tick(60, "149.60", "149.62")).unwrap();
        view.update_tick(tick(150, "149.20", "149.22")).unwrap();

        let past = view
            .mid_at_least_ago(at(150), Duration::milliseconds(100))
            .unwrap();
        assert_eq!(past, dec("149.60"));
        assert!(view
            .mid_at_least_ago(at(150), Duration::milliseconds(200))
            .is_none());
    }
}
