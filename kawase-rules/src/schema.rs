//! Serde schema for the structured rule document.
//!
//! The document is the single law governing entries and exits. It is parsed
//! strictly: unknown fields are rejected so a drifting generator fails loudly
//! at install time instead of silently losing conditions.

use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use kawase_core::{Direction, Pips, Price, Symbol, Timeframe};

use crate::{RuleError, RuleResult};

/// `HH:MM` (de)serialization for broker-local times.
pub(crate) mod hhmm {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(value: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod hhmm_opt {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(time) => serializer.serialize_some(&time.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|value| {
            NaiveTime::parse_from_str(&value, FORMAT).map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

/// Directional bias for the trading day.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DailyBias {
    Buy,
    Sell,
    Neutral,
}

/// Inclusive price band inside which entries are allowed.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PriceZone {
    pub min: Price,
    pub max: Price,
}

impl PriceZone {
    /// Zone bounds are admissible, so both edges count as inside.
    #[must_use]
    pub fn contains(&self, price: Price) -> bool {
        self.min <= price && price <= self.max
    }
}

/// RSI bounds on a named timeframe.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RsiPredicate {
    pub timeframe: Timeframe,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Decimal>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmaCondition {
    PriceAbove,
    PriceBelow,
    CrossAbove,
    CrossBelow,
}

/// Price-versus-EMA requirement on a named timeframe.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EmaPredicate {
    pub timeframe: Timeframe,
    pub condition: EmaCondition,
    pub period: u32,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MacdCondition {
    HistogramPositive,
    HistogramNegative,
    SignalCrossAbove,
    SignalCrossBelow,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MacdPredicate {
    pub timeframe: Timeframe,
    pub condition: MacdCondition,
}

/// Optional per-indicator entry requirements; absent predicates always hold.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IndicatorRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsi: Option<RsiPredicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema: Option<EmaPredicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macd: Option<MacdPredicate>,
}

/// Tagged predicate used by the avoid-condition list; the same mini DSL as
/// the entry indicators.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "indicator", rename_all = "snake_case")]
pub enum IndicatorPredicate {
    Rsi(RsiPredicate),
    Ema(EmaPredicate),
    Macd(MacdPredicate),
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SpreadLimit {
    pub max_pips: Pips,
}

impl Default for SpreadLimit {
    fn default() -> Self {
        Self {
            max_pips: Decimal::from(10),
        }
    }
}

/// Broker-local window during which entries are forbidden.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AvoidWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    pub reason: String,
}

impl AvoidWindow {
    /// Inclusive containment; windows may wrap past midnight (23:00-01:00).
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TimeFilter {
    #[serde(default)]
    pub avoid_times: Vec<AvoidWindow>,
}

impl TimeFilter {
    /// Returns the matching window's reason when `time` must be avoided.
    #[must_use]
    pub fn blocking_reason(&self, time: NaiveTime) -> Option<&str> {
        self.avoid_times
            .iter()
            .find(|window| window.contains(time))
            .map(|window| window.reason.as_str())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EntryConditions {
    pub should_trade: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_zone: Option<PriceZone>,
    #[serde(default)]
    pub indicators: IndicatorRequirements,
    #[serde(default)]
    pub spread: SpreadLimit,
    #[serde(default)]
    pub time_filter: TimeFilter,
    /// Conditions that mark the rule's thesis as no longer holding.
    #[serde(default)]
    pub avoid_if: Vec<IndicatorPredicate>,
}

/// One step of the staged take-profit ladder.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TakeProfitLevel {
    pub pips: Pips,
    pub close_percent: Decimal,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TrailingRule {
    pub activate_at_pips: Pips,
    pub trail_distance_pips: Pips,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StopLossRule {
    pub initial_pips: Pips,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_level: Option<Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing: Option<TrailingRule>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossBias {
    Bullish,
    Bearish,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelBreakSide {
    Above,
    Below,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSide {
    Above,
    Below,
}

/// How much of the original volume an indicator exit closes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ExitAction {
    #[serde(rename = "close_50")]
    Close50,
    #[serde(rename = "close_75")]
    Close75,
    #[serde(rename = "close_all")]
    CloseAll,
}

impl ExitAction {
    /// Fraction of the initial volume covered by the action.
    #[must_use]
    pub fn fraction(self) -> Decimal {
        match self {
            Self::Close50 => Decimal::new(50, 2),
            Self::Close75 => Decimal::new(75, 2),
            Self::CloseAll => Decimal::ONE,
        }
    }
}

/// Exit rules driven by indicator state on a closed bar.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndicatorExit {
    MacdCross {
        timeframe: Timeframe,
        direction: CrossBias,
        action: ExitAction,
    },
    EmaBreak {
        timeframe: Timeframe,
        period: u32,
        direction: LevelBreakSide,
        action: ExitAction,
    },
    RsiThreshold {
        timeframe: Timeframe,
        threshold: Decimal,
        direction: ThresholdSide,
        action: ExitAction,
    },
}

impl IndicatorExit {
    #[must_use]
    pub fn action(&self) -> ExitAction {
        match self {
            Self::MacdCross { action, .. }
            | Self::EmaBreak { action, .. }
            | Self::RsiThreshold { action, .. } => *action,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TimeExits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_hold_minutes: Option<i64>,
    #[serde(default, with = "hhmm_opt", skip_serializing_if = "Option::is_none")]
    pub force_close_time: Option<NaiveTime>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExitStrategy {
    pub take_profit: Vec<TakeProfitLevel>,
    pub stop_loss: StopLossRule,
    #[serde(default)]
    pub indicator_exits: Vec<IndicatorExit>,
    #[serde(default)]
    pub time_exits: TimeExits,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RiskManagement {
    pub position_size_multiplier: Decimal,
    pub max_positions: usize,
    pub max_risk_per_trade_percent: Decimal,
    pub max_total_exposure_percent: Decimal,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct KeyLevels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_target: Option<Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidation_level: Option<Price>,
    #[serde(default)]
    pub critical_support: Vec<Price>,
    #[serde(default)]
    pub critical_resistance: Vec<Price>,
}

/// The authoritative trade law, immutable once installed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredRule {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub symbol: Symbol,
    pub daily_bias: DailyBias,
    pub confidence: Decimal,
    pub entry_conditions: EntryConditions,
    pub exit_strategy: ExitStrategy,
    pub risk_management: RiskManagement,
    pub key_levels: KeyLevels,
}

impl StructuredRule {
    /// Whether `at` falls inside the rule's validity interval.
    #[must_use]
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.generated_at <= at && at <= self.valid_until
    }

    /// Boundary validation applied before a rule may enter the store.
    pub fn validate(&self) -> RuleResult<()> {
        if self.generated_at > self.valid_until {
            return Err(RuleError::InvalidInterval {
                generated_at: self.generated_at,
                valid_until: self.valid_until,
            });
        }
        if self.confidence < Decimal::ZERO || self.confidence > Decimal::ONE {
            return Err(RuleError::ConfidenceOutOfRange(self.confidence));
        }
        let risk = &self.risk_management;
        if risk.position_size_multiplier < Decimal::ZERO
            || risk.position_size_multiplier > Decimal::ONE
        {
            return Err(RuleError::MultiplierOutOfRange(
                risk.position_size_multiplier,
            ));
        }
        if risk.max_positions == 0 {
            return Err(RuleError::ZeroMaxPositions);
        }

        let entry = &self.entry_conditions;
        if entry.should_trade {
            if entry.direction.is_none() {
                return Err(RuleError::MissingDirection);
            }
            let zone = entry.price_zone.ok_or(RuleError::MissingPriceZone)?;
            if zone.min > zone.max {
                return Err(RuleError::InvertedPriceZone {
                    min: zone.min,
                    max: zone.max,
                });
            }
        }

        let exit = &self.exit_strategy;
        if exit.stop_loss.initial_pips <= Decimal::ZERO {
            return Err(RuleError::NonPositiveStop);
        }
        if let Some(trailing) = &exit.stop_loss.trailing {
            if trailing.activate_at_pips <= Decimal::ZERO
                || trailing.trail_distance_pips <= Decimal::ZERO
            {
                return Err(RuleError::InvalidTrailing);
            }
        }

        let mut total_percent = Decimal::ZERO;
        let mut previous_pips: Option<Pips> = None;
        for (index, level) in exit.take_profit.iter().enumerate() {
            if level.pips <= Decimal::ZERO || level.close_percent <= Decimal::ZERO {
                return Err(RuleError::LadderNonPositive { index });
            }
            if let Some(prev) = previous_pips {
                if level.pips <= prev {
                    return Err(RuleError::LadderNotAscending { index });
                }
            }
            previous_pips = Some(level.pips);
            total_percent += level.close_percent;
        }
        if total_percent > Decimal::from(100) {
            return Err(RuleError::LadderOverAllocated {
                total: total_percent,
            });
        }
        Ok(())
    }

    /// Canonical JSON encoding: struct declaration order, RFC3339 UTC.
    pub fn to_canonical_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Strict decode; unknown fields anywhere in the document are an error.
    pub fn from_json(raw: &str) -> RuleResult<Self> {
        serde_json::from_str(raw).map_err(|err| RuleError::Schema(err.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    pub(crate) fn sample_rule() -> StructuredRule {
        StructuredRule {
            version: 3,
            generated_at: Utc.with_ymd_and_hms(2025, 10, 23, 9, 0, 0).unwrap(),
            valid_until: Utc.with_ymd_and_hms(2025, 10, 23, 10, 0, 0).unwrap(),
            symbol: "USDJPY".into(),
            daily_bias: DailyBias::Buy,
            confidence: dec("0.72"),
            entry_conditions: EntryConditions {
                should_trade: true,
                direction: Some(Direction::Buy),
                price_zone: Some(PriceZone {
                    min: dec("149.50"),
                    max: dec("149.65"),
                }),
                indicators: IndicatorRequirements::default(),
                spread: SpreadLimit {
                    max_pips: dec("3"),
                },
                time_filter: TimeFilter::default(),
                avoid_if: Vec::new(),
            },
            exit_strategy: ExitStrategy {
                take_profit: vec![
                    TakeProfitLevel {
                        pips: dec("10"),
                        close_percent: dec("30"),
                    },
                    TakeProfitLevel {
                        pips: dec("20"),
                        close_percent: dec("40"),
                    },
                ],
                stop_loss: StopLossRule {
                    initial_pips: dec("15"),
                    price_level: None,
                    trailing: None,
                },
                indicator_exits: Vec::new(),
                time_exits: TimeExits::default(),
            },
            risk_management: RiskManagement {
                position_size_multiplier: dec("0.8"),
                max_positions: 2,
                max_risk_per_trade_percent: dec("1"),
                max_total_exposure_percent: dec("5"),
            },
            key_levels: KeyLevels::default(),
        }
    }

    #[test]
    fn valid_rule_passes() {
        sample_rule().validate().unwrap();
    }

    #[test]
    fn inverted_interval_is_rejected() {
        let mut rule = sample_rule();
        rule.valid_until = rule.generated_at - chrono::Duration::seconds(1);
        assert!(matches!(
            rule.validate(),
            Err(RuleError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn duplicate_tp_pips_are_rejected() {
        let mut rule = sample_rule();
        rule.exit_strategy.take_profit = vec![
            TakeProfitLevel {
                pips: dec("10"),
                close_percent: dec("30"),
            },
            TakeProfitLevel {
                pips: dec("10"),
                close_percent: dec("30"),
            },
        ];
        assert!(matches!(
            rule.validate(),
            Err(RuleError::LadderNotAscending { index: 1 })
        ));
    }

    #[test]
    fn over_allocated_ladder_is_rejected() {
        let mut rule = sample_rule();
        rule.exit_strategy.take_profit = vec![
            TakeProfitLevel {
                pips: dec("10"),
                close_percent: dec("60"),
            },
            TakeProfitLevel {
                pips: dec("20"),
                close_percent: dec("60"),
            },
        ];
        assert!(matches!(
            rule.validate(),
            Err(RuleError::LadderOverAllocated { .. })
        ));
    }

    #[test]
    fn trade_without_direction_is_rejected() {
        let mut rule = sample_rule();
        rule.entry_conditions.direction = None;
        assert!(matches!(rule.validate(), Err(RuleError::MissingDirection)));
    }

    #[test]
    fn canonical_json_is_a_fixed_point() {
        let rule = sample_rule();
        let first = rule.to_canonical_json().unwrap();
        let decoded = StructuredRule::from_json(&first).unwrap();
        let second = decoded.to_canonical_json().unwrap();
        assert_eq!(first, second);
        assert_eq!(decoded, rule);
    }

    #[test]
    fn unknown_fields_are_rejected_on_decode() {
        let mut json: serde_json::Value =
            serde_json::from_str(&sample_rule().to_canonical_json().unwrap()).unwrap();
        json["entry_conditions"]["surprise"] = serde_json::json!(true);
        let raw = json.to_string();
        assert!(matches!(
            StructuredRule::from_json(&raw),
            Err(RuleError::Schema(_))
        ));
    }

    #[test]
    fn avoid_window_wraps_past_midnight() {
        let window = AvoidWindow {
            start: NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(1, 0, 0).unwrap(),
            reason: "rollover".into(),
        };
        assert!(window.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(window.contains(NaiveTime::from_hms_opt(0, 30, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn hhmm_times_round_trip() {
        let exits = TimeExits {
            max_hold_minutes: Some(240),
            force_close_time: NaiveTime::from_hms_opt(23, 0, 0),
        };
        let json = serde_json::to_string(&exits).unwrap();
        assert!(json.contains(r#""force_close_time":"23:00""#));
        let back: TimeExits = serde_json::from_str(&json).unwrap();
        assert_eq!(back, exits);
    }
}
