//! Structured trading rules: the schema the market-analysis service must
//! produce, boundary validation, and the append-only rule history.

mod schema;
mod store;

pub use schema::{
    AvoidWindow, CrossBias, DailyBias, EmaCondition, EmaPredicate, EntryConditions, ExitAction,
    ExitStrategy, IndicatorExit, IndicatorPredicate, IndicatorRequirements, KeyLevels,
    LevelBreakSide, MacdCondition, MacdPredicate, PriceZone, RiskManagement, RsiPredicate,
    SpreadLimit, StopLossRule, StructuredRule, TakeProfitLevel, ThresholdSide, TimeExits,
    TimeFilter, TrailingRule,
};
pub use store::RuleStore;

use thiserror::Error;

/// Result alias for rule handling.
pub type RuleResult<T> = Result<T, RuleError>;

/// Failures surfaced when installing or decoding a rule.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("generated_at {generated_at} is after valid_until {valid_until}")]
    InvalidInterval {
        generated_at: chrono::DateTime<chrono::Utc>,
        valid_until: chrono::DateTime<chrono::Utc>,
    },
    #[error("rule targets '{rule}' but this store tracks '{store}'")]
    SymbolMismatch { rule: String, store: String },
    #[error("should_trade is set but no direction is given")]
    MissingDirection,
    #[error("should_trade is set but no price zone is given")]
    MissingPriceZone,
    #[error("price zone min {min} exceeds max {max}")]
    InvertedPriceZone {
        min: kawase_core::Price,
        max: kawase_core::Price,
    },
    #[error("take-profit ladder must be strictly ascending (level {index})")]
    LadderNotAscending { index: usize },
    #[error("take-profit close percentages sum to {total}, above 100")]
    LadderOverAllocated { total: rust_decimal::Decimal },
    #[error("take-profit level {index} has non-positive values")]
    LadderNonPositive { index: usize },
    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(rust_decimal::Decimal),
    #[error("position_size_multiplier {0} is outside [0, 1]")]
    MultiplierOutOfRange(rust_decimal::Decimal),
    #[error("max_positions must be at least 1")]
    ZeroMaxPositions,
    #[error("stop-loss initial_pips must be positive")]
    NonPositiveStop,
    #[error("trailing stop parameters must be positive")]
    InvalidTrailing,
    #[error("rule document is malformed: {0}")]
    Schema(String),
}
