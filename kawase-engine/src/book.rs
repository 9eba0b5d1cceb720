//! Authoritative in-memory set of open positions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::debug;

use kawase_core::{price_to_pips, Direction, Pips, PositionId, Price, Symbol, Volume};
use kawase_rules::StructuredRule;

/// Failures that indicate corrupted position state. Any of these aborts the
/// engine through an emergency stop.
#[derive(Debug, Error)]
pub enum BookError {
    #[error("unknown position {0}")]
    Unknown(PositionId),
    #[error("close volume {volume} exceeds remaining {remaining} on {id}")]
    Overclose {
        id: PositionId,
        volume: Volume,
        remaining: Volume,
    },
    #[error("non-positive close volume {volume} on {id}")]
    NonPositiveVolume { id: PositionId, volume: Volume },
    #[error("take-profit level {level} out of order on {id} (expected {expected})")]
    LadderOutOfOrder {
        id: PositionId,
        level: usize,
        expected: usize,
    },
}

/// A live (or just-closed) position together with the rule that created it.
///
/// Mutated only through [`PositionBook`]; everyone else sees `&Position`.
#[derive(Clone, Debug)]
pub struct Position {
    pub id: PositionId,
    pub symbol: Symbol,
    pub direction: Direction,
    pub opened_at: DateTime<Utc>,
    pub open_price: Price,
    pub volume_initial: Volume,
    pub volume_remaining: Volume,
    /// Final backstop derived from account equity at open.
    pub insurance_sl: Price,
    /// Protective stop actually resting at the broker.
    pub placed_sl: Price,
    pub trailing_stop: Option<Price>,
    /// Best favourable excursion seen so far, in pips.
    pub max_favourable_pips: Pips,
    pub executed_tp_levels: BTreeSet<usize>,
    pub equity_at_open: Price,
    /// Realized PnL of this position's partial closes, account currency.
    pub realized_pnl: Price,
    pub rule_snapshot: Arc<StructuredRule>,
}

impl Position {
    /// Signed favourable pips from entry at `current` (positive = profit).
    #[must_use]
    pub fn pips_from_entry(&self, current: Price, pip_scale: Decimal) -> Pips {
        price_to_pips(
            self.direction.favourable_delta(self.open_price, current),
            pip_scale,
        )
    }

    /// Unrealized PnL of the remaining volume, account currency.
    #[must_use]
    pub fn unrealized_pnl(&self, current: Price, contract_size: Decimal) -> Price {
        self.direction.favourable_delta(self.open_price, current)
            * self.volume_remaining
            * contract_size
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.volume_remaining.is_zero()
    }

    /// Whether an adverse price touches the given protective level.
    #[must_use]
    pub fn stop_hit(&self, level: Price, current: Price) -> bool {
        match self.direction {
            Direction::Buy => current <= level,
            Direction::Sell => current >= level,
        }
    }
}

/// Parameters for opening a position; the book assigns the id.
pub struct OpenParams {
    pub symbol: Symbol,
    pub direction: Direction,
    pub opened_at: DateTime<Utc>,
    pub open_price: Price,
    pub volume: Volume,
    pub insurance_sl: Price,
    pub placed_sl: Price,
    pub equity_at_open: Price,
    pub rule_snapshot: Arc<StructuredRule>,
}

/// Outcome of a (partial) close applied to the book.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseOutcome {
    /// Volume remains open.
    Reduced,
    /// The position is now fully closed and retired to history.
    Closed,
}

/// Single owner of position state with executed-milestone tracking and a
/// realized-PnL tally.
#[derive(Default)]
pub struct PositionBook {
    next_id: u64,
    open: BTreeMap<PositionId, Position>,
    closed: Vec<Position>,
    realized_pnl: Price,
}

impl PositionBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open positions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.open.len()
    }

    /// Open positions in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.open.values()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<PositionId> {
        self.open.keys().copied().collect()
    }

    #[must_use]
    pub fn get(&self, id: PositionId) -> Option<&Position> {
        self.open.get(&id)
    }

    /// Sum of realized PnL across all partial-close records.
    #[must_use]
    pub fn realized_pnl(&self) -> Price {
        self.realized_pnl
    }

    /// Closed positions retired since the last drain.
    pub fn drain_closed(&mut self) -> Vec<Position> {
        std::mem::take(&mut self.closed)
    }

    pub fn open_position(&mut self, params: OpenParams) -> &Position {
        self.next_id += 1;
        let id = PositionId(self.next_id);
        let position = Position {
            id,
            symbol: params.symbol,
            direction: params.direction,
            opened_at: params.opened_at,
            open_price: params.open_price,
            volume_initial: params.volume,
            volume_remaining: params.volume,
            insurance_sl: params.insurance_sl,
            placed_sl: params.placed_sl,
            trailing_stop: None,
            max_favourable_pips: Decimal::ZERO,
            executed_tp_levels: BTreeSet::new(),
            equity_at_open: params.equity_at_open,
            realized_pnl: Decimal::ZERO,
            rule_snapshot: params.rule_snapshot,
        };
        self.open.entry(id).or_insert(position)
    }

    /// Refresh the favourable-excursion high-water mark for every position.
    pub fn observe_price(&mut self, current: Price, pip_scale: Decimal) {
        for position in self.open.values_mut() {
            let pips = position.pips_from_entry(current, pip_scale);
            if pips > position.max_favourable_pips {
                position.max_favourable_pips = pips;
            }
        }
    }

    /// Apply a close fill. Volume is in lots of the position itself.
    pub fn apply_close(
        &mut self,
        id: PositionId,
        volume: Volume,
        fill_price: Price,
        contract_size: Decimal,
    ) -> Result<CloseOutcome, BookError> {
        let position = self.open.get_mut(&id).ok_or(BookError::Unknown(id))?;
        if volume <= Decimal::ZERO {
            return Err(BookError::NonPositiveVolume { id, volume });
        }
        if volume > position.volume_remaining {
            return Err(BookError::Overclose {
                id,
                volume,
                remaining: position.volume_remaining,
            });
        }
        let realized = position
            .direction
            .favourable_delta(position.open_price, fill_price)
            * volume
            * contract_size;
        position.volume_remaining -= volume;
        position.realized_pnl += realized;
        self.realized_pnl += realized;
        debug!(
            position = %id,
            %volume,
            %fill_price,
            %realized,
            remaining = %position.volume_remaining,
            "close applied"
        );
        if position.is_closed() {
            let closed = self.open.remove(&id).expect("position present");
            self.closed.push(closed);
            Ok(CloseOutcome::Closed)
        } else {
            Ok(CloseOutcome::Reduced)
        }
    }

    /// Record a take-profit ladder milestone; levels execute exactly once and
    /// strictly in order.
    pub fn mark_tp_executed(&mut self, id: PositionId, level: usize) -> Result<(), BookError> {
        let position = self.open.get_mut(&id).ok_or(BookError::Unknown(id))?;
        let expected = position.executed_tp_levels.len();
        if level != expected {
            return Err(BookError::LadderOutOfOrder {
                id,
                level,
                expected,
            });
        }
        position.executed_tp_levels.insert(level);
        Ok(())
    }

    /// Raise (never lower) the trailing stop. Returns true when it moved.
    pub fn advance_trailing(&mut self, id: PositionId, stop: Price) -> Result<bool, BookError> {
        let position = self.open.get_mut(&id).ok_or(BookError::Unknown(id))?;
        let improved = match (position.direction, position.trailing_stop) {
            (_, None) => true,
            (Direction::Buy, Some(current)) => stop > current,
            (Direction::Sell, Some(current)) => stop < current,
        };
        if improved {
            position.trailing_stop = Some(stop);
        }
        Ok(improved)
    }

    /// Move the resting protective stop closer to price; loosening requests
    /// are ignored.
    pub fn tighten_placed_stop(&mut self, id: PositionId, stop: Price) -> Result<bool, BookError> {
        let position = self.open.get_mut(&id).ok_or(BookError::Unknown(id))?;
        let tighter = match position.direction {
            Direction::Buy => stop > position.placed_sl,
            Direction::Sell => stop < position.placed_sl,
        };
        if tighter {
            position.placed_sl = stop;
        }
        Ok(tighter)
    }
}
