//! Pure decision logic: entry gates, exit pipeline and the indicator
//! predicate DSL shared with the anomaly monitor.
//!
//! Nothing here touches the gateway or mutates state; callers apply the
//! returned steps through the position book.

use std::fmt;

use chrono::NaiveTime;
use rust_decimal::Decimal;

use kawase_core::{
    pips_to_price, AccountInfo, CloseReason, Direction, Pips, Price, SymbolInfo, Volume,
};
use kawase_market::{MarketView, Staleness};
use kawase_rules::{
    CrossBias, DailyBias, EmaCondition, EmaPredicate, ExitAction, IndicatorExit,
    IndicatorPredicate, LevelBreakSide, MacdCondition, MacdPredicate, RsiPredicate,
    StructuredRule, ThresholdSide,
};

use crate::book::Position;

/// Concrete reason an entry was refused, one per gate.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryRejection {
    NeutralBias,
    TradingDisabled,
    MaxPositions { open: usize, max: usize },
    StaleMarket,
    NoQuote,
    OutsideZone { mid: Price, min: Price, max: Price },
    Indicator(String),
    SpreadTooWide { spread: Pips, max: Pips },
    AvoidWindow(String),
    InsufficientMargin,
    ZeroVolume,
}

impl fmt::Display for EntryRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeutralBias => f.write_str("daily bias is neutral"),
            Self::TradingDisabled => f.write_str("rule disables trading"),
            Self::MaxPositions { open, max } => {
                write!(f, "position limit reached ({open}/{max})")
            }
            Self::StaleMarket => f.write_str("market view is stale"),
            Self::NoQuote => f.write_str("no tick available"),
            Self::OutsideZone { mid, min, max } => {
                write!(f, "price {mid} outside zone [{min}, {max}]")
            }
            Self::Indicator(reason) => write!(f, "indicator requirement failed: {reason}"),
            Self::SpreadTooWide { spread, max } => {
                write!(f, "spread {spread} pips above limit {max}")
            }
            Self::AvoidWindow(reason) => write!(f, "inside avoid window: {reason}"),
            Self::InsufficientMargin => f.write_str("free margin insufficient"),
            Self::ZeroVolume => f.write_str("sized volume rounds to zero"),
        }
    }
}

/// Everything the entry gates read.
pub struct EntryContext<'a> {
    pub rule: &'a StructuredRule,
    pub view: &'a MarketView,
    pub staleness: Staleness,
    pub open_positions: usize,
    pub broker_local: NaiveTime,
    pub account: &'a AccountInfo,
    pub symbol_info: &'a SymbolInfo,
    pub base_lot: Volume,
    /// Fraction of equity the insurance backstop may lose.
    pub insurance_equity_pct: Decimal,
}

/// Sized, stop-annotated order intent produced by a successful entry pass.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryPlan {
    pub direction: Direction,
    pub volume: Volume,
    /// Stop distance demanded by the rule, in price units from the fill.
    pub rule_stop_distance: Price,
    /// Equity-derived backstop distance, in price units from the fill.
    pub insurance_distance: Price,
}

impl EntryPlan {
    fn protective(&self, fill: Price, distance: Price) -> Price {
        match self.direction {
            Direction::Buy => fill - distance,
            Direction::Sell => fill + distance,
        }
    }

    /// Stop submitted with the order: the tighter of rule and insurance.
    #[must_use]
    pub fn placed_stop(&self, fill: Price) -> Price {
        self.protective(fill, self.rule_stop_distance.min(self.insurance_distance))
    }

    /// The final backstop retained on the position.
    #[must_use]
    pub fn insurance_stop(&self, fill: Price) -> Price {
        self.protective(fill, self.insurance_distance)
    }
}

/// Run the five entry gates in order; the first failing gate names the
/// rejection. The free-margin gate is the caller's dry-run (gateway access
/// is not available here).
pub fn evaluate_entry(ctx: &EntryContext<'_>) -> Result<EntryPlan, EntryRejection> {
    let rule = ctx.rule;
    let entry = &rule.entry_conditions;

    // Gate 1: admissibility.
    if rule.daily_bias == DailyBias::Neutral {
        return Err(EntryRejection::NeutralBias);
    }
    if !entry.should_trade {
        return Err(EntryRejection::TradingDisabled);
    }
    let max = rule.risk_management.max_positions;
    if ctx.open_positions >= max {
        return Err(EntryRejection::MaxPositions {
            open: ctx.open_positions,
            max,
        });
    }
    if ctx.staleness == Staleness::Stale {
        return Err(EntryRejection::StaleMarket);
    }
    let Some(tick) = ctx.view.tick() else {
        return Err(EntryRejection::NoQuote);
    };
    let direction = entry.direction.ok_or(EntryRejection::TradingDisabled)?;

    // Gate 2: price zone on the mid price, bounds inclusive.
    let mid = tick.mid();
    let zone = entry.price_zone.ok_or(EntryRejection::TradingDisabled)?;
    if !zone.contains(mid) {
        return Err(EntryRejection::OutsideZone {
            mid,
            min: zone.min,
            max: zone.max,
        });
    }

    // Gate 3: every populated indicator requirement must hold.
    if let Some(pred) = &entry.indicators.rsi {
        match eval_rsi(pred, ctx.view) {
            Ok(true) => {}
            Ok(false) => {
                return Err(EntryRejection::Indicator(format!(
                    "RSI bounds not met on {}",
                    pred.timeframe
                )))
            }
            Err(missing) => return Err(EntryRejection::Indicator(missing)),
        }
    }
    if let Some(pred) = &entry.indicators.ema {
        match eval_ema(pred, ctx.view, mid) {
            Ok(true) => {}
            Ok(false) => {
                return Err(EntryRejection::Indicator(format!(
                    "EMA{} {:?} not met on {}",
                    pred.period, pred.condition, pred.timeframe
                )))
            }
            Err(missing) => return Err(EntryRejection::Indicator(missing)),
        }
    }
    if let Some(pred) = &entry.indicators.macd {
        match eval_macd(pred, ctx.view) {
            Ok(true) => {}
            Ok(false) => {
                return Err(EntryRejection::Indicator(format!(
                    "MACD {:?} not met on {}",
                    pred.condition, pred.timeframe
                )))
            }
            Err(missing) => return Err(EntryRejection::Indicator(missing)),
        }
    }

    // Gate 4: guardrails. Spread exactly at the limit is admissible.
    let spread = tick.spread_pips(ctx.view.pip_scale());
    if spread > entry.spread.max_pips {
        return Err(EntryRejection::SpreadTooWide {
            spread,
            max: entry.spread.max_pips,
        });
    }
    if let Some(reason) = entry.time_filter.blocking_reason(ctx.broker_local) {
        return Err(EntryRejection::AvoidWindow(reason.to_string()));
    }

    // Gate 5: risk sizing and protective-stop distances.
    let raw = ctx.base_lot * rule.risk_management.position_size_multiplier;
    let volume = ctx.symbol_info.normalize_volume(raw);
    if volume.is_zero() {
        return Err(EntryRejection::ZeroVolume);
    }
    let notional_per_price_unit = volume * ctx.symbol_info.contract_size;
    let insurance_distance = if notional_per_price_unit.is_zero() {
        Decimal::ZERO
    } else {
        ctx.insurance_equity_pct * ctx.account.equity / notional_per_price_unit
    };
    let rule_stop_distance = pips_to_price(
        rule.exit_strategy.stop_loss.initial_pips,
        ctx.view.pip_scale(),
    );

    Ok(EntryPlan {
        direction,
        volume,
        rule_stop_distance,
        insurance_distance,
    })
}

// ---------------------------------------------------------------------------
// Indicator predicate DSL
// ---------------------------------------------------------------------------

/// `Ok(bool)` when evaluable, `Err(reason)` when the data is missing.
fn eval_rsi(pred: &RsiPredicate, view: &MarketView) -> Result<bool, String> {
    let rsi = view
        .indicators(pred.timeframe)
        .and_then(|snapshot| snapshot.rsi)
        .ok_or_else(|| format!("RSI unavailable on {}", pred.timeframe))?;
    if let Some(min) = pred.min {
        if rsi < min {
            return Ok(false);
        }
    }
    if let Some(max) = pred.max {
        if rsi > max {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eval_ema(pred: &EmaPredicate, view: &MarketView, price: Price) -> Result<bool, String> {
    let snapshot = view
        .indicators(pred.timeframe)
        .ok_or_else(|| format!("indicators unavailable on {}", pred.timeframe))?;
    let ema = snapshot
        .ema(pred.period)
        .ok_or_else(|| format!("EMA{} unavailable on {}", pred.period, pred.timeframe))?;
    let held = match pred.condition {
        EmaCondition::PriceAbove => price > ema,
        EmaCondition::PriceBelow => price < ema,
        EmaCondition::CrossAbove => {
            let prev = snapshot
                .prev_close
                .ok_or_else(|| format!("previous close unavailable on {}", pred.timeframe))?;
            prev <= ema && price > ema
        }
        EmaCondition::CrossBelow => {
            let prev = snapshot
                .prev_close
                .ok_or_else(|| format!("previous close unavailable on {}", pred.timeframe))?;
            prev >= ema && price < ema
        }
    };
    Ok(held)
}

fn eval_macd(pred: &MacdPredicate, view: &MarketView) -> Result<bool, String> {
    let current = view
        .indicators(pred.timeframe)
        .and_then(|snapshot| snapshot.macd)
        .ok_or_else(|| format!("MACD unavailable on {}", pred.timeframe))?;
    let held = match pred.condition {
        MacdCondition::HistogramPositive => current.histogram > Decimal::ZERO,
        MacdCondition::HistogramNegative => current.histogram < Decimal::ZERO,
        MacdCondition::SignalCrossAbove | MacdCondition::SignalCrossBelow => {
            let previous = view
                .previous_indicators(pred.timeframe)
                .and_then(|snapshot| snapshot.macd)
                .ok_or_else(|| format!("previous MACD unavailable on {}", pred.timeframe))?;
            let prev_diff = previous.line - previous.signal;
            let curr_diff = current.line - current.signal;
            match pred.condition {
                MacdCondition::SignalCrossAbove => prev_diff <= Decimal::ZERO && curr_diff > Decimal::ZERO,
                _ => prev_diff >= Decimal::ZERO && curr_diff < Decimal::ZERO,
            }
        }
    };
    Ok(held)
}

/// Evaluate one avoid-condition predicate. `None` means the required data is
/// not available yet, so the condition cannot fire.
#[must_use]
pub fn predicate_holds(
    predicate: &IndicatorPredicate,
    view: &MarketView,
    price: Price,
) -> Option<bool> {
    let result = match predicate {
        IndicatorPredicate::Rsi(pred) => eval_rsi(pred, view),
        IndicatorPredicate::Ema(pred) => eval_ema(pred, view, price),
        IndicatorPredicate::Macd(pred) => eval_macd(pred, view),
    };
    result.ok()
}

// ---------------------------------------------------------------------------
// Exit pipeline
// ---------------------------------------------------------------------------

/// One action from the ordered per-position exit checks.
#[derive(Clone, Debug, PartialEq)]
pub enum ExitStep {
    FullClose { reason: CloseReason },
    /// Close `fraction` of the *initial* volume for ladder level `level`.
    LadderClose { level: usize, fraction: Decimal },
    /// Apply the configured indicator-exit action.
    IndicatorClose { action: ExitAction },
    /// Move the trailing stop; the book ignores adverse moves.
    AdvanceTrailing { stop: Price },
}

pub struct ExitContext<'a> {
    pub position: &'a Position,
    pub view: &'a MarketView,
    pub now: chrono::DateTime<chrono::Utc>,
    pub broker_local: NaiveTime,
    /// Indicator exits only arm on a closed bar, never mid-bar.
    pub bar_closed: bool,
}

/// Ordered exit checks for one position. Emergency (Layer-1) conditions run
/// before this pipeline and are not re-checked here.
#[must_use]
pub fn evaluate_exits(ctx: &ExitContext<'_>) -> Vec<ExitStep> {
    let position = ctx.position;
    let exit = &position.rule_snapshot.exit_strategy;
    let Some(tick) = ctx.view.tick() else {
        return Vec::new();
    };
    let pip_scale = ctx.view.pip_scale();
    // A long closes at the bid, a short at the ask.
    let close_price = match position.direction {
        Direction::Buy => tick.bid,
        Direction::Sell => tick.ask,
    };
    let mid = tick.mid();
    let favourable_pips = position.pips_from_entry(mid, pip_scale);
    let mut steps = Vec::new();

    // Hard stop-loss: rule level, resting stop, then the insurance backstop.
    if let Some(level) = exit.stop_loss.price_level {
        if position.stop_hit(level, close_price) {
            return vec![ExitStep::FullClose {
                reason: CloseReason::StopLoss,
            }];
        }
    }
    if position.stop_hit(position.placed_sl, close_price) {
        return vec![ExitStep::FullClose {
            reason: CloseReason::StopLoss,
        }];
    }
    if position.stop_hit(position.insurance_sl, close_price) {
        return vec![ExitStep::FullClose {
            reason: CloseReason::InsuranceStop,
        }];
    }

    // Take-profit ladder, strictly ascending from the first unexecuted level.
    let hundred = Decimal::from(100);
    let mut level = position.executed_tp_levels.len();
    while let Some(target) = exit.take_profit.get(level) {
        if favourable_pips >= target.pips {
            steps.push(ExitStep::LadderClose {
                level,
                fraction: target.close_percent / hundred,
            });
            level += 1;
        } else {
            break;
        }
    }

    // Trailing stop.
    if let Some(trailing) = &exit.stop_loss.trailing {
        let mut effective = position.trailing_stop;
        if position.max_favourable_pips >= trailing.activate_at_pips {
            let high_water_delta = pips_to_price(position.max_favourable_pips, pip_scale);
            let trail = pips_to_price(trailing.trail_distance_pips, pip_scale);
            let candidate = match position.direction {
                Direction::Buy => position.open_price + high_water_delta - trail,
                Direction::Sell => position.open_price - high_water_delta + trail,
            };
            let improved = match (position.direction, effective) {
                (_, None) => true,
                (Direction::Buy, Some(current)) => candidate > current,
                (Direction::Sell, Some(current)) => candidate < current,
            };
            if improved {
                steps.push(ExitStep::AdvanceTrailing { stop: candidate });
                effective = Some(candidate);
            }
        }
        if let Some(stop) = effective {
            if position.stop_hit(stop, close_price) {
                steps.push(ExitStep::FullClose {
                    reason: CloseReason::TrailingStop,
                });
                return steps;
            }
        }
    }

    // Indicator exits: at most one per position per bar close, declaration
    // order breaks ties.
    if ctx.bar_closed {
        for rule in &exit.indicator_exits {
            if indicator_exit_fires(rule, ctx.view, mid) {
                steps.push(ExitStep::IndicatorClose {
                    action: rule.action(),
                });
                break;
            }
        }
    }

    // Time exits.
    if let Some(max_hold) = exit.time_exits.max_hold_minutes {
        let held = ctx.now - position.opened_at;
        if held >= chrono::Duration::minutes(max_hold) {
            steps.push(ExitStep::FullClose {
                reason: CloseReason::MaxHoldTime,
            });
            return steps;
        }
    }
    if let Some(force_close) = exit.time_exits.force_close_time {
        if ctx.broker_local >= force_close {
            steps.push(ExitStep::FullClose {
                reason: CloseReason::ForceCloseTime,
            });
        }
    }

    steps
}

pub(crate) fn indicator_exit_fires(rule: &IndicatorExit, view: &MarketView, price: Price) -> bool {
    match rule {
        IndicatorExit::MacdCross {
            timeframe,
            direction,
            ..
        } => {
            let condition = match direction {
                CrossBias::Bullish => MacdCondition::SignalCrossAbove,
                CrossBias::Bearish => MacdCondition::SignalCrossBelow,
            };
            eval_macd(
                &MacdPredicate {
                    timeframe: *timeframe,
                    condition,
                },
                view,
            )
            .unwrap_or(false)
        }
        IndicatorExit::EmaBreak {
            timeframe,
            period,
            direction,
            ..
        } => {
            let Some(ema) = view
                .indicators(*timeframe)
                .and_then(|snapshot| snapshot.ema(*period))
            else {
                return false;
            };
            match direction {
                LevelBreakSide::Above => price > ema,
                LevelBreakSide::Below => price < ema,
            }
        }
        IndicatorExit::RsiThreshold {
            timeframe,
            threshold,
            direction,
            ..
        } => {
            let Some(rsi) = view
                .indicators(*timeframe)
                .and_then(|snapshot| snapshot.rsi)
            else {
                return false;
            };
            match direction {
                ThresholdSide::Above => rsi > *threshold,
                ThresholdSide::Below => rsi < *threshold,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::PositionBook;
    use crate::testutil::{
        dec, macd, open_buy, rule, rule_with, snapshot, t0, tick, view, view_with_tick,
    };
    use kawase_core::Timeframe;

    fn account() -> AccountInfo {
        AccountInfo {
            currency: "JPY".into(),
            balance: dec("1000000"),
            equity: dec("1000000"),
            margin_free: dec("1000000"),
        }
    }

    fn entry_ctx<'a>(
        rule: &'a StructuredRule,
        view: &'a MarketView,
        account: &'a AccountInfo,
        info: &'a SymbolInfo,
    ) -> EntryContext<'a> {
        EntryContext {
            rule,
            view,
            staleness: Staleness::Fresh,
            open_positions: 0,
            broker_local: chrono::NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            account,
            symbol_info: info,
            base_lot: dec("0.1"),
            insurance_equity_pct: dec("0.05"),
        }
    }

    #[test]
    fn happy_path_sizes_and_stops() {
        let rule = rule();
        let view = view_with_tick("149.598", "149.602");
        let account = account();
        let info = SymbolInfo::usdjpy();
        let plan = evaluate_entry(&entry_ctx(&rule, &view, &account, &info)).unwrap();
        assert_eq!(plan.direction, Direction::Buy);
        assert_eq!(plan.volume, dec("0.08"));
        assert_eq!(plan.rule_stop_distance, dec("0.15"));
        // 5% of 1,000,000 over 0.08 lots of 100k units.
        assert_eq!(plan.insurance_distance, dec("6.25"));
        // The tighter rule stop is placed; the insurance level is retained.
        assert_eq!(plan.placed_stop(dec("149.602")), dec("149.452"));
        assert_eq!(plan.insurance_stop(dec("149.602")), dec("143.352"));
    }

    #[test]
    fn spread_exactly_at_limit_is_admissible() {
        let rule = rule();
        let account = account();
        let info = SymbolInfo::usdjpy();
        // 3.0 pips of spread around mid 149.60.
        let view = view_with_tick("149.585", "149.615");
        assert!(evaluate_entry(&entry_ctx(&rule, &view, &account, &info)).is_ok());

        let view = view_with_tick("149.584", "149.616");
        assert!(matches!(
            evaluate_entry(&entry_ctx(&rule, &view, &account, &info)),
            Err(EntryRejection::SpreadTooWide { .. })
        ));
    }

    #[test]
    fn zone_bounds_are_inclusive() {
        let rule = rule();
        let account = account();
        let info = SymbolInfo::usdjpy();
        let view = view_with_tick("149.649", "149.651");
        assert!(evaluate_entry(&entry_ctx(&rule, &view, &account, &info)).is_ok());

        let view = view_with_tick("149.659", "149.661");
        assert!(matches!(
            evaluate_entry(&entry_ctx(&rule, &view, &account, &info)),
            Err(EntryRejection::OutsideZone { .. })
        ));
    }

    #[test]
    fn neutral_bias_and_position_cap_reject() {
        let account = account();
        let info = SymbolInfo::usdjpy();
        let view = view_with_tick("149.598", "149.602");

        let neutral = rule_with(|raw| raw["daily_bias"] = "NEUTRAL".into());
        assert_eq!(
            evaluate_entry(&entry_ctx(&neutral, &view, &account, &info)),
            Err(EntryRejection::NeutralBias)
        );

        let rule = rule();
        let mut ctx = entry_ctx(&rule, &view, &account, &info);
        ctx.open_positions = 2;
        assert!(matches!(
            evaluate_entry(&ctx),
            Err(EntryRejection::MaxPositions { open: 2, max: 2 })
        ));
    }

    #[test]
    fn stale_market_suppresses_entries() {
        let rule = rule();
        let account = account();
        let info = SymbolInfo::usdjpy();
        let view = view_with_tick("149.598", "149.602");
        let mut ctx = entry_ctx(&rule, &view, &account, &info);
        ctx.staleness = Staleness::Stale;
        assert_eq!(evaluate_entry(&ctx), Err(EntryRejection::StaleMarket));
    }

    #[test]
    fn avoid_window_blocks_with_its_reason() {
        let rule = rule_with(|raw| {
            raw["entry_conditions"]["time_filter"] = serde_json::json!({
                "avoid_times": [{"start": "10:30", "end": "11:30", "reason": "london fix"}]
            });
        });
        let account = account();
        let info = SymbolInfo::usdjpy();
        let view = view_with_tick("149.598", "149.602");
        assert_eq!(
            evaluate_entry(&entry_ctx(&rule, &view, &account, &info)),
            Err(EntryRejection::AvoidWindow("london fix".into()))
        );
    }

    #[test]
    fn rsi_requirement_gates_entry() {
        let rule = rule_with(|raw| {
            raw["entry_conditions"]["indicators"] = serde_json::json!({
                "rsi": {"timeframe": "M15", "min": "40", "max": "70"}
            });
        });
        let account = account();
        let info = SymbolInfo::usdjpy();

        let mut ok_view = view_with_tick("149.598", "149.602");
        ok_view.update_timeframe_indicators(Timeframe::M15, snapshot(Some("55"), None, None));
        assert!(evaluate_entry(&entry_ctx(&rule, &ok_view, &account, &info)).is_ok());

        let mut hot_view = view_with_tick("149.598", "149.602");
        hot_view.update_timeframe_indicators(Timeframe::M15, snapshot(Some("75"), None, None));
        assert!(matches!(
            evaluate_entry(&entry_ctx(&rule, &hot_view, &account, &info)),
            Err(EntryRejection::Indicator(_))
        ));

        // Missing data is a rejection, not a pass.
        let bare_view = view_with_tick("149.598", "149.602");
        assert!(matches!(
            evaluate_entry(&entry_ctx(&rule, &bare_view, &account, &info)),
            Err(EntryRejection::Indicator(_))
        ));
    }

    #[test]
    fn macd_signal_cross_requires_opposite_previous_bar() {
        let rule = rule_with(|raw| {
            raw["entry_conditions"]["indicators"] = serde_json::json!({
                "macd": {"timeframe": "M15", "condition": "signal_cross_above"}
            });
        });
        let account = account();
        let info = SymbolInfo::usdjpy();

        let mut crossed = view_with_tick("149.598", "149.602");
        let mut below = kawase_core::IndicatorSnapshot::default();
        below.macd = Some(macd("-0.02", "0.01"));
        let mut above = kawase_core::IndicatorSnapshot::default();
        above.macd = Some(macd("0.03", "0.01"));
        crossed.update_timeframe_indicators(Timeframe::M15, below);
        crossed.update_timeframe_indicators(Timeframe::M15, above.clone());
        assert!(evaluate_entry(&entry_ctx(&rule, &crossed, &account, &info)).is_ok());

        // Already above on the previous bar: no cross.
        let mut flat = view_with_tick("149.598", "149.602");
        flat.update_timeframe_indicators(Timeframe::M15, above.clone());
        flat.update_timeframe_indicators(Timeframe::M15, above);
        assert!(matches!(
            evaluate_entry(&entry_ctx(&rule, &flat, &account, &info)),
            Err(EntryRejection::Indicator(_))
        ));
    }

    #[test]
    fn ladder_levels_fire_in_sequence_and_can_stack() {
        let mut book = PositionBook::new();
        let id = open_buy(&mut book, rule());
        let mut view = view();
        view.update_tick(tick(1_000, "149.848", "149.852")).unwrap();
        book.observe_price(dec("149.85"), dec("100"));
        let position = book.get(id).unwrap();

        let steps = evaluate_exits(&ExitContext {
            position,
            view: &view,
            now: t0() + chrono::Duration::seconds(1),
            broker_local: chrono::NaiveTime::from_hms_opt(11, 0, 1).unwrap(),
            bar_closed: false,
        });
        // 25 favourable pips reach the 10- and 20-pip rungs only.
        assert_eq!(
            steps,
            vec![
                ExitStep::LadderClose {
                    level: 0,
                    fraction: dec("0.3"),
                },
                ExitStep::LadderClose {
                    level: 1,
                    fraction: dec("0.4"),
                },
            ]
        );
    }

    #[test]
    fn placed_stop_close_beats_ladder() {
        let mut book = PositionBook::new();
        let id = open_buy(&mut book, rule());
        let mut view = view();
        view.update_tick(tick(1_000, "149.448", "149.452")).unwrap();
        let position = book.get(id).unwrap();
        let steps = evaluate_exits(&ExitContext {
            position,
            view: &view,
            now: t0() + chrono::Duration::seconds(1),
            broker_local: chrono::NaiveTime::from_hms_opt(11, 0, 1).unwrap(),
            bar_closed: false,
        });
        assert_eq!(
            steps,
            vec![ExitStep::FullClose {
                reason: CloseReason::StopLoss,
            }]
        );
    }

    #[test]
    fn trailing_advances_then_triggers() {
        let trailing_rule = rule_with(|raw| {
            raw["exit_strategy"]["stop_loss"]["trailing"] = serde_json::json!({
                "activate_at_pips": "10",
                "trail_distance_pips": "5"
            });
            // Keep the ladder out of the way of the trailing checks.
            raw["exit_strategy"]["take_profit"] =
                serde_json::json!([{"pips": "100", "close_percent": "50"}]);
        });
        let mut book = PositionBook::new();
        let id = open_buy(&mut book, trailing_rule);
        book.observe_price(dec("149.80"), dec("100"));

        // Still above the trail: only the advance is requested.
        let mut view = view();
        view.update_tick(tick(1_000, "149.798", "149.802")).unwrap();
        let steps = evaluate_exits(&ExitContext {
            position: book.get(id).unwrap(),
            view: &view,
            now: t0() + chrono::Duration::seconds(1),
            broker_local: chrono::NaiveTime::from_hms_opt(11, 0, 1).unwrap(),
            bar_closed: false,
        });
        // High water 20 pips - 5 trail = stop at 149.75.
        assert_eq!(
            steps,
            vec![ExitStep::AdvanceTrailing {
                stop: dec("149.7500"),
            }]
        );
        book.advance_trailing(id, dec("149.7500")).unwrap();

        // Price falls onto the trail: full close.
        let mut view = super::super::testutil::view();
        view.update_tick(tick(2_000, "149.748", "149.752")).unwrap();
        let steps = evaluate_exits(&ExitContext {
            position: book.get(id).unwrap(),
            view: &view,
            now: t0() + chrono::Duration::seconds(2),
            broker_local: chrono::NaiveTime::from_hms_opt(11, 0, 2).unwrap(),
            bar_closed: false,
        });
        assert_eq!(
            steps,
            vec![ExitStep::FullClose {
                reason: CloseReason::TrailingStop,
            }]
        );
    }

    #[test]
    fn indicator_exit_only_arms_on_bar_close() {
        let exit_rule = rule_with(|raw| {
            raw["exit_strategy"]["indicator_exits"] = serde_json::json!([
                {"type": "rsi_threshold", "timeframe": "M15", "threshold": "70",
                 "direction": "above", "action": "close_50"}
            ]);
        });
        let mut book = PositionBook::new();
        let id = open_buy(&mut book, exit_rule);
        let mut view = view();
        view.update_tick(tick(1_000, "149.618", "149.622")).unwrap();
        view.update_timeframe_indicators(Timeframe::M15, snapshot(Some("75"), None, None));

        let mid_bar = evaluate_exits(&ExitContext {
            position: book.get(id).unwrap(),
            view: &view,
            now: t0() + chrono::Duration::seconds(1),
            broker_local: chrono::NaiveTime::from_hms_opt(11, 0, 1).unwrap(),
            bar_closed: false,
        });
        assert!(mid_bar.is_empty());

        let on_close = evaluate_exits(&ExitContext {
            position: book.get(id).unwrap(),
            view: &view,
            now: t0() + chrono::Duration::seconds(1),
            broker_local: chrono::NaiveTime::from_hms_opt(11, 0, 1).unwrap(),
            bar_closed: true,
        });
        assert_eq!(
            on_close,
            vec![ExitStep::IndicatorClose {
                action: ExitAction::Close50,
            }]
        );
    }

    #[test]
    fn time_exits_close_on_hold_and_wall_clock() {
        let timed_rule = rule_with(|raw| {
            raw["exit_strategy"]["time_exits"] = serde_json::json!({
                "max_hold_minutes": 240,
                "force_close_time": "23:00"
            });
        });
        let mut book = PositionBook::new();
        let id = open_buy(&mut book, timed_rule);
        let mut view = view();
        view.update_tick(tick(1_000, "149.618", "149.622")).unwrap();

        let held_too_long = evaluate_exits(&ExitContext {
            position: book.get(id).unwrap(),
            view: &view,
            now: t0() + chrono::Duration::minutes(240),
            broker_local: chrono::NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
            bar_closed: false,
        });
        assert_eq!(
            held_too_long,
            vec![ExitStep::FullClose {
                reason: CloseReason::MaxHoldTime,
            }]
        );

        let past_close = evaluate_exits(&ExitContext {
            position: book.get(id).unwrap(),
            view: &view,
            now: t0() + chrono::Duration::minutes(10),
            broker_local: chrono::NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
            bar_closed: false,
        });
        assert_eq!(
            past_close,
            vec![ExitStep::FullClose {
                reason: CloseReason::ForceCloseTime,
            }]
        );
    }
}
