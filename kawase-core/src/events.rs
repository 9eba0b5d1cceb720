//! Ordered event records emitted by the engine plus the escalation and
//! verdict vocabulary shared with the advisory oracle.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Direction, Pips, PositionId, Price, Volume};

/// How urgent an escalation is for the re-evaluation layer.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Condition that caused an anomaly-layer escalation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationTrigger {
    CriticalSupportBroken { level: Price },
    CriticalResistanceBroken { level: Price },
    MacdReversal,
    EmaCrossReversal,
    ThreeCandleAdversity,
    AvoidConditionMet { detail: String },
    RsiOverheat { value: Decimal },
    PeakDrawdown { peak_pips: Pips, retrace_pct: Decimal },
    AdvisoryEscalate,
}

impl EscalationTrigger {
    /// Stable key used for cooldown bookkeeping and coalescing.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Self::CriticalSupportBroken { .. } => "critical_support_broken",
            Self::CriticalResistanceBroken { .. } => "critical_resistance_broken",
            Self::MacdReversal => "macd_reversal",
            Self::EmaCrossReversal => "ema_cross_reversal",
            Self::ThreeCandleAdversity => "three_candle_adversity",
            Self::AvoidConditionMet { .. } => "avoid_condition_met",
            Self::RsiOverheat { .. } => "rsi_overheat",
            Self::PeakDrawdown { .. } => "peak_drawdown",
            Self::AdvisoryEscalate => "advisory_escalate",
        }
    }
}

impl fmt::Display for EscalationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Non-actionable signal telling the coordinator to re-evaluate a position.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Escalation {
    pub at: DateTime<Utc>,
    pub severity: Severity,
    pub trigger: EscalationTrigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<PositionId>,
}

/// Action requested by the advisory oracle.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum VerdictAction {
    Continue,
    ClosePartial { partial_close_pct: Decimal },
    CloseAll,
    TightenStop { new_stop_pips: Pips },
    Escalate,
}

impl VerdictAction {
    /// Rank used when several verdicts compete for the same position; the
    /// most protective action wins.
    #[must_use]
    pub fn severity_rank(&self) -> u8 {
        match self {
            Self::Continue => 0,
            Self::Escalate => 1,
            Self::TightenStop { .. } => 2,
            Self::ClosePartial { .. } => 3,
            Self::CloseAll => 4,
        }
    }
}

/// Wire-stable advisory verdict: `{action, reason, severity?, ...}`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Verdict {
    #[serde(flatten)]
    pub action: VerdictAction,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl Verdict {
    #[must_use]
    pub fn continue_with(reason: impl Into<String>) -> Self {
        Self {
            action: VerdictAction::Continue,
            reason: reason.into(),
            severity: None,
        }
    }

    #[must_use]
    pub fn close_all(reason: impl Into<String>, severity: Severity) -> Self {
        Self {
            action: VerdictAction::CloseAll,
            reason: reason.into(),
            severity: Some(severity),
        }
    }
}

/// Why a position (or part of one) was closed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Layer-1: combined loss reached 2% of equity at open.
    Account2pct,
    /// Layer-1: price moved 50 pips against the position.
    #[serde(rename = "hard_stop_50pips")]
    HardStopPips,
    /// Layer-1: spread widened past the alert threshold.
    SpreadAlert,
    /// Layer-1: price jumped too far within 100 ms.
    FlashCrash,
    StopLoss,
    InsuranceStop,
    TakeProfit,
    TrailingStop,
    IndicatorExit,
    MaxHoldTime,
    ForceCloseTime,
    WeekendClose,
    AdvisoryClose,
    AdvisoryTimeout,
    InvariantViolation,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Account2pct => "account_2pct",
            Self::HardStopPips => "hard_stop_50pips",
            Self::SpreadAlert => "spread_alert",
            Self::FlashCrash => "flash_crash",
            Self::StopLoss => "stop_loss",
            Self::InsuranceStop => "insurance_stop",
            Self::TakeProfit => "take_profit",
            Self::TrailingStop => "trailing_stop",
            Self::IndicatorExit => "indicator_exit",
            Self::MaxHoldTime => "max_hold_time",
            Self::ForceCloseTime => "force_close_time",
            Self::WeekendClose => "weekend_close",
            Self::AdvisoryClose => "advisory_close",
            Self::AdvisoryTimeout => "advisory_timeout",
            Self::InvariantViolation => "invariant_violation",
        };
        f.write_str(label)
    }
}

/// Tagged union of everything the engine reports to the sink.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    RuleActivated {
        version: u32,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    EntryExecuted {
        position_id: PositionId,
        direction: Direction,
        price: Price,
        volume: Volume,
    },
    PartialClose {
        position_id: PositionId,
        price: Price,
        volume: Volume,
        reason: CloseReason,
        /// Take-profit ladder index when the close came from the ladder.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<usize>,
    },
    FullClose {
        position_id: PositionId,
        price: Price,
        volume: Volume,
        reason: CloseReason,
    },
    ForceClose {
        position_id: PositionId,
        price: Price,
        volume: Volume,
        reason: CloseReason,
    },
    EmergencyStop {
        reason: String,
    },
    Layer2Trigger {
        escalation: Escalation,
    },
    Layer3aVerdict {
        position_id: PositionId,
        verdict: Verdict,
    },
    Layer3bVerdict {
        position_id: PositionId,
        trigger: String,
        verdict: Verdict,
    },
    UnknownOutcome {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position_id: Option<PositionId>,
        detail: String,
    },
    JobFailed {
        job: String,
        error: String,
    },
    DailyCheckpoint {
        label: String,
    },
}

/// A single sink record carrying a global, monotonic sequence number.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EventRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EventRecord {
    /// Canonical JSON encoding with stable field order (struct declaration
    /// order, RFC3339 UTC timestamps).
    pub fn to_canonical_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
