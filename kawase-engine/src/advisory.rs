//! External advisory oracle interface and the snapshot handed to it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use kawase_core::{
    EmaAlignment, Escalation, PositionSnapshot, RecentIndicators, Timeframe, Verdict,
};
use kawase_market::MarketView;

use crate::book::Position;

/// Failures of the advisory call path; a timeout resolves to the layer's
/// safe default action.
#[derive(Debug, Error)]
pub enum AdvisoryError {
    #[error("advisory call failed: {0}")]
    Failed(String),
    #[error("advisory call timed out")]
    Timeout,
}

/// External decision service consulted for periodic and emergency reviews.
///
/// Implementations wrap the opaque market-analysis backend; the engine only
/// ever sees structured verdicts.
#[async_trait]
pub trait Advisory: Send + Sync {
    /// Scheduled per-position review.
    async fn periodic(&self, snapshot: PositionSnapshot) -> Result<Verdict, AdvisoryError>;

    /// Review triggered by an anomaly escalation.
    async fn emergency(
        &self,
        snapshot: PositionSnapshot,
        escalation: Escalation,
    ) -> Result<Verdict, AdvisoryError>;
}

/// Build the wire snapshot for one position from the current market state.
#[must_use]
pub fn position_snapshot(
    position: &Position,
    view: &MarketView,
    now: DateTime<Utc>,
    contract_size: Decimal,
) -> PositionSnapshot {
    let current_price = view.mid().unwrap_or(position.open_price);
    let unrealized_pips = position.pips_from_entry(current_price, view.pip_scale());
    let unrealized_pct = if position.equity_at_open.is_zero() {
        Decimal::ZERO
    } else {
        position.unrealized_pnl(current_price, contract_size) / position.equity_at_open
            * Decimal::from(100)
    };
    let h1 = view.indicators(Timeframe::H1);
    let alignment = match h1.and_then(|snapshot| {
        Some((snapshot.ema(20)?, snapshot.ema(50)?))
    }) {
        Some((ema20, ema50)) => {
            if current_price > ema20 && current_price > ema50 {
                EmaAlignment::Bullish
            } else if current_price < ema20 && current_price < ema50 {
                EmaAlignment::Bearish
            } else {
                EmaAlignment::Mixed
            }
        }
        None => EmaAlignment::Unknown,
    };
    PositionSnapshot {
        position_id: position.id,
        symbol: position.symbol.clone(),
        direction: position.direction,
        open_price: position.open_price,
        open_time: position.opened_at,
        current_price,
        unrealized_pips,
        unrealized_pct,
        holding_minutes: (now - position.opened_at).num_minutes(),
        recent_indicators: RecentIndicators {
            rsi_h1: h1.and_then(|snapshot| snapshot.rsi),
            ema_h1_alignment: alignment,
            macd_h1_histogram: h1.and_then(|snapshot| snapshot.macd).map(|macd| macd.histogram),
        },
        last_bars_m15: view
            .recent_bars(Timeframe::M15, 3)
            .into_iter()
            .cloned()
            .collect(),
    }
}
