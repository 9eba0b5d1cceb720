//! Layer-1: per-tick emergency checks that bypass every other layer.

use chrono::Duration;
use rust_decimal::Decimal;

use kawase_core::{CloseReason, PositionId};
use kawase_market::MarketView;

use crate::book::Position;
use crate::settings::SafetySettings;

/// A position that must be closed immediately, with the first matching
/// reason.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EmergencyHit {
    pub position_id: PositionId,
    pub reason: CloseReason,
}

/// Check every open position against the emergency conditions, in order:
/// account loss, hard stop, spread, flash crash. First hit wins per
/// position. No I/O happens here; the caller issues the closes.
#[must_use]
pub fn scan_emergencies<'a>(
    view: &MarketView,
    positions: impl Iterator<Item = &'a Position>,
    safety: &SafetySettings,
    contract_size: Decimal,
) -> Vec<EmergencyHit> {
    let Some(tick) = view.tick() else {
        return Vec::new();
    };
    let mid = tick.mid();
    let spread = tick.spread_pips(view.pip_scale());
    let flash_move = view
        .mid_at_least_ago(tick.time, Duration::milliseconds(100))
        .map(|past| ((mid - past) * view.pip_scale()).abs());

    let mut hits = Vec::new();
    for position in positions {
        let reason = if account_loss_breached(position, mid, safety, contract_size) {
            Some(CloseReason::Account2pct)
        } else if position.pips_from_entry(mid, view.pip_scale()) <= -safety.hard_stop_pips {
            Some(CloseReason::HardStopPips)
        } else if spread >= safety.spread_alert_pips {
            Some(CloseReason::SpreadAlert)
        } else if flash_move.is_some_and(|jump| jump >= safety.flash_crash_pips) {
            Some(CloseReason::FlashCrash)
        } else {
            None
        };
        if let Some(reason) = reason {
            hits.push(EmergencyHit {
                position_id: position.id,
                reason,
            });
        }
    }
    hits
}

fn account_loss_breached(
    position: &Position,
    mid: kawase_core::Price,
    safety: &SafetySettings,
    contract_size: Decimal,
) -> bool {
    let combined = position.realized_pnl + position.unrealized_pnl(mid, contract_size);
    combined <= -(safety.max_account_loss_pct * position.equity_at_open)
}
