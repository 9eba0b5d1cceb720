//! Layer-2: minute and five-minute anomaly detection.
//!
//! This layer only observes. Every finding becomes an escalation for the
//! coordinator; position closes are never issued from here.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use kawase_core::{
    Direction, Escalation, EscalationTrigger, PositionId, Severity, Timeframe,
};
use kawase_market::MarketView;
use kawase_rules::{IndicatorPredicate, MacdCondition, MacdPredicate};

use crate::book::Position;
use crate::evaluator::predicate_holds;
use crate::settings::SafetySettings;

const RSI_OVERHEAT_HIGH: u32 = 80;
const RSI_OVERHEAT_LOW: u32 = 20;

/// Minute-cadence anomaly checks with per-(position, trigger) cooldown so a
/// persistent condition does not spam the coordinator.
pub struct Layer2Monitor {
    cooldown: Duration,
    drawdown_alert_pct: Decimal,
    drawdown_min_peak_pips: Decimal,
    recent: HashMap<(Option<PositionId>, &'static str), DateTime<Utc>>,
}

impl Layer2Monitor {
    #[must_use]
    pub fn new(safety: &SafetySettings) -> Self {
        Self {
            cooldown: safety.layer2_cooldown,
            drawdown_alert_pct: safety.drawdown_alert_pct,
            drawdown_min_peak_pips: safety.drawdown_min_peak_pips,
            recent: HashMap::new(),
        }
    }

    /// Drop tracking state for a closed position.
    pub fn forget(&mut self, id: PositionId) {
        self.recent.retain(|(position, _), _| *position != Some(id));
    }

    /// The 60-second sweep: level breaches, indicator reversals, candle
    /// adversity and peak drawdown.
    pub fn minute_checks<'a>(
        &mut self,
        view: &MarketView,
        positions: impl Iterator<Item = &'a Position>,
        now: DateTime<Utc>,
    ) -> Vec<Escalation> {
        let mut out = Vec::new();
        let Some(mid) = view.mid() else {
            return out;
        };
        for position in positions {
            self.check_critical_levels(view, position, now, &mut out);
            self.check_indicator_reversal(view, position, now, &mut out);
            self.check_candle_adversity(view, position, now, &mut out);
            self.check_peak_drawdown(view, position, mid, now, &mut out);
        }
        out
    }

    /// The 300-second sweep: rule avoid-conditions and RSI overheat.
    pub fn five_minute_checks<'a>(
        &mut self,
        view: &MarketView,
        positions: impl Iterator<Item = &'a Position>,
        now: DateTime<Utc>,
    ) -> Vec<Escalation> {
        let mut out = Vec::new();
        let Some(mid) = view.mid() else {
            return out;
        };
        for position in positions {
            for predicate in &position.rule_snapshot.entry_conditions.avoid_if {
                if predicate_holds(predicate, view, mid) == Some(true) {
                    self.raise(
                        now,
                        Severity::High,
                        EscalationTrigger::AvoidConditionMet {
                            detail: predicate_label(predicate),
                        },
                        Some(position.id),
                        &mut out,
                    );
                }
            }
            let rsi_h1 = view
                .indicators(Timeframe::H1)
                .and_then(|snapshot| snapshot.rsi);
            if let Some(rsi) = rsi_h1 {
                let overheated = match position.direction {
                    Direction::Buy => rsi > Decimal::from(RSI_OVERHEAT_HIGH),
                    Direction::Sell => rsi < Decimal::from(RSI_OVERHEAT_LOW),
                };
                if overheated {
                    self.raise(
                        now,
                        Severity::Medium,
                        EscalationTrigger::RsiOverheat { value: rsi },
                        Some(position.id),
                        &mut out,
                    );
                }
            }
        }
        out
    }

    fn check_critical_levels(
        &mut self,
        view: &MarketView,
        position: &Position,
        now: DateTime<Utc>,
        out: &mut Vec<Escalation>,
    ) {
        let Some(close) = view.latest_bar(Timeframe::M15).map(|bar| bar.close) else {
            return;
        };
        let levels = &position.rule_snapshot.key_levels;
        match position.direction {
            Direction::Buy => {
                if let Some(&support) = levels.critical_support.first() {
                    if close < support {
                        self.raise(
                            now,
                            Severity::High,
                            EscalationTrigger::CriticalSupportBroken { level: support },
                            Some(position.id),
                            out,
                        );
                    }
                }
            }
            Direction::Sell => {
                if let Some(&resistance) = levels.critical_resistance.first() {
                    if close > resistance {
                        self.raise(
                            now,
                            Severity::High,
                            EscalationTrigger::CriticalResistanceBroken { level: resistance },
                            Some(position.id),
                            out,
                        );
                    }
                }
            }
        }
    }

    fn check_indicator_reversal(
        &mut self,
        view: &MarketView,
        position: &Position,
        now: DateTime<Utc>,
        out: &mut Vec<Escalation>,
    ) {
        // MACD signal cross against the position on M15.
        let against = match position.direction {
            Direction::Buy => MacdCondition::SignalCrossBelow,
            Direction::Sell => MacdCondition::SignalCrossAbove,
        };
        let crossed = predicate_holds(
            &IndicatorPredicate::Macd(MacdPredicate {
                timeframe: Timeframe::M15,
                condition: against,
            }),
            view,
            view.mid().unwrap_or_default(),
        );
        if crossed == Some(true) {
            self.raise(
                now,
                Severity::Medium,
                EscalationTrigger::MacdReversal,
                Some(position.id),
                out,
            );
        }

        // EMA20/50 crossover against the position on M15.
        let pair = |snapshot: &kawase_core::IndicatorSnapshot| {
            Some((snapshot.ema(20)?, snapshot.ema(50)?))
        };
        let current = view.indicators(Timeframe::M15).and_then(pair);
        let previous = view.previous_indicators(Timeframe::M15).and_then(pair);
        if let (Some((cur20, cur50)), Some((prev20, prev50))) = (current, previous) {
            let crossed_against = match position.direction {
                Direction::Buy => prev20 >= prev50 && cur20 < cur50,
                Direction::Sell => prev20 <= prev50 && cur20 > cur50,
            };
            if crossed_against {
                self.raise(
                    now,
                    Severity::Medium,
                    EscalationTrigger::EmaCrossReversal,
                    Some(position.id),
                    out,
                );
            }
        }
    }

    fn check_candle_adversity(
        &mut self,
        view: &MarketView,
        position: &Position,
        now: DateTime<Utc>,
        out: &mut Vec<Escalation>,
    ) {
        let bars = view.recent_bars(Timeframe::M15, 3);
        if bars.len() == 3 && bars.iter().all(|bar| bar.is_adverse_for(position.direction)) {
            self.raise(
                now,
                Severity::Medium,
                EscalationTrigger::ThreeCandleAdversity,
                Some(position.id),
                out,
            );
        }
    }

    fn check_peak_drawdown(
        &mut self,
        view: &MarketView,
        position: &Position,
        mid: Decimal,
        now: DateTime<Utc>,
        out: &mut Vec<Escalation>,
    ) {
        let peak = position.max_favourable_pips;
        if peak < self.drawdown_min_peak_pips {
            return;
        }
        let current = position.pips_from_entry(mid, view.pip_scale());
        if peak.is_zero() {
            return;
        }
        let retrace_pct = (peak - current) / peak * Decimal::from(100);
        if retrace_pct >= self.drawdown_alert_pct {
            self.raise(
                now,
                Severity::Medium,
                EscalationTrigger::PeakDrawdown {
                    peak_pips: peak,
                    retrace_pct,
                },
                Some(position.id),
                out,
            );
        }
    }

    fn raise(
        &mut self,
        now: DateTime<Utc>,
        severity: Severity,
        trigger: EscalationTrigger,
        position_id: Option<PositionId>,
        out: &mut Vec<Escalation>,
    ) {
        let key = (position_id, trigger.key());
        if let Some(last) = self.recent.get(&key) {
            if now - *last < self.cooldown {
                return;
            }
        }
        self.recent.insert(key, now);
        out.push(Escalation {
            at: now,
            severity,
            trigger,
            position_id,
        });
    }
}

fn predicate_label(predicate: &IndicatorPredicate) -> String {
    match predicate {
        IndicatorPredicate::Rsi(pred) => format!("rsi bounds on {}", pred.timeframe),
        IndicatorPredicate::Ema(pred) => {
            format!("ema{} {:?} on {}", pred.period, pred.condition, pred.timeframe)
        }
        IndicatorPredicate::Macd(pred) => {
            format!("macd {:?} on {}", pred.condition, pred.timeframe)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::PositionBook;
    use crate::settings::EngineSettings;
    use crate::testutil::{bar, dec, open_buy, rule_with, snapshot, t0, tick, view};

    fn monitor() -> Layer2Monitor {
        Layer2Monitor::new(&EngineSettings::defaults().safety)
    }

    #[test]
    fn support_breach_escalates_once_per_cooldown() {
        let mut book = PositionBook::new();
        let id = open_buy(
            &mut book,
            rule_with(|raw| {
                raw["key_levels"]["critical_support"] = serde_json::json!(["149.40"]);
            }),
        );
        let mut view = view();
        view.update_tick(tick(0, "149.30", "149.304")).unwrap();
        view.update_bars(Timeframe::M15, bar(0, "149.45", "149.46", "149.30", "149.35"))
            .unwrap();

        let mut monitor = monitor();
        let first = monitor.minute_checks(&view, book.iter(), t0());
        assert_eq!(first.len(), 1);
        assert!(matches!(
            first[0].trigger,
            EscalationTrigger::CriticalSupportBroken { .. }
        ));
        assert_eq!(first[0].position_id, Some(id));

        // Inside the cooldown the same condition stays quiet.
        let again = monitor.minute_checks(&view, book.iter(), t0() + Duration::seconds(60));
        assert!(again.is_empty());
        let later = monitor.minute_checks(&view, book.iter(), t0() + Duration::seconds(700));
        assert_eq!(later.len(), 1);
    }

    #[test]
    fn three_adverse_candles_escalate() {
        let mut book = PositionBook::new();
        open_buy(&mut book, rule_with(|_| {}));
        let mut view = view();
        view.update_tick(tick(0, "149.55", "149.554")).unwrap();
        for idx in 0..3 {
            view.update_bars(
                Timeframe::M15,
                bar(idx * 15, "149.60", "149.61", "149.50", "149.55"),
            )
            .unwrap();
        }
        let escalations = monitor().minute_checks(&view, book.iter(), t0());
        assert!(escalations
            .iter()
            .any(|esc| esc.trigger == EscalationTrigger::ThreeCandleAdversity));
    }

    #[test]
    fn rsi_overheat_only_fires_against_the_position() {
        let mut book = PositionBook::new();
        open_buy(&mut book, rule_with(|_| {}));
        let mut view = view();
        view.update_tick(tick(0, "149.60", "149.604")).unwrap();
        view.update_timeframe_indicators(Timeframe::H1, snapshot(Some("85"), None, None));

        let escalations = monitor().five_minute_checks(&view, book.iter(), t0());
        assert!(escalations
            .iter()
            .any(|esc| matches!(esc.trigger, EscalationTrigger::RsiOverheat { .. })));

        let (calm_view, calm_book) = view_with_rsi("60");
        let none = monitor().five_minute_checks(&calm_view, calm_book.iter(), t0());
        assert!(none.is_empty());
    }

    fn view_with_rsi(rsi: &str) -> (MarketView, PositionBook) {
        let mut book = PositionBook::new();
        open_buy(&mut book, rule_with(|_| {}));
        let mut view = view();
        view.update_tick(tick(0, "149.60", "149.604")).unwrap();
        view.update_timeframe_indicators(Timeframe::H1, snapshot(Some(rsi), None, None));
        (view, book)
    }

    #[test]
    fn avoid_condition_fires_when_predicate_holds() {
        let mut book = PositionBook::new();
        open_buy(
            &mut book,
            rule_with(|raw| {
                raw["entry_conditions"]["avoid_if"] = serde_json::json!([
                    {"indicator": "rsi", "timeframe": "H1", "min": "0", "max": "40"}
                ]);
            }),
        );
        let mut view = view();
        view.update_tick(tick(0, "149.60", "149.604")).unwrap();
        view.update_timeframe_indicators(Timeframe::H1, snapshot(Some("35"), None, None));

        let escalations = monitor().five_minute_checks(&view, book.iter(), t0());
        assert!(escalations
            .iter()
            .any(|esc| matches!(esc.trigger, EscalationTrigger::AvoidConditionMet { .. })));
    }

    #[test]
    fn peak_drawdown_requires_a_real_peak() {
        let mut book = PositionBook::new();
        let _id = open_buy(&mut book, rule_with(|_| {}));
        book.observe_price(dec("149.80"), dec("100"));
        let mut view = view();
        // Retraced from +20 pips to +2 pips: 90% off the peak.
        view.update_tick(tick(0, "149.618", "149.622")).unwrap();

        let escalations = monitor().minute_checks(&view, book.iter(), t0());
        assert!(escalations
            .iter()
            .any(|esc| matches!(esc.trigger, EscalationTrigger::PeakDrawdown { .. })));
    }

    #[test]
    fn forget_clears_cooldown_state() {
        let mut book = PositionBook::new();
        let id = open_buy(
            &mut book,
            rule_with(|raw| {
                raw["key_levels"]["critical_support"] = serde_json::json!(["149.40"]);
            }),
        );
        let mut view = view();
        view.update_tick(tick(0, "149.30", "149.304")).unwrap();
        view.update_bars(Timeframe::M15, bar(0, "149.45", "149.46", "149.30", "149.35"))
            .unwrap();
        let mut monitor = monitor();
        assert_eq!(monitor.minute_checks(&view, book.iter(), t0()).len(), 1);
        monitor.forget(id);
        assert_eq!(
            monitor
                .minute_checks(&view, book.iter(), t0() + Duration::seconds(1))
                .len(),
            1
        );
    }
}
