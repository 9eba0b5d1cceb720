//! Broker-agnostic execution interface used by the rest of the engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use kawase_core::{AccountInfo, Direction, PositionId, Price, Symbol, SymbolInfo, Volume};

mod retry;
mod sim;

pub use retry::RetryingGateway;
pub use sim::{SimulatedGateway, SimulatedGatewayConfig};

/// Convenience alias for gateway results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Common error type returned by gateway implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Requotes, price-off rejections and other retriable conditions.
    #[error("transient broker rejection: {0}")]
    Transient(String),
    /// Insufficient free margin; fatal for new entries.
    #[error("insufficient funds: {0}")]
    NoMoney(String),
    /// Volume outside the tradable range; fatal for new entries.
    #[error("invalid volume: {0}")]
    InvalidVolume(String),
    /// Transport-level failures (terminal unreachable, no quote).
    #[error("transport error: {0}")]
    Transport(String),
    /// The bounded call budget elapsed.
    #[error("gateway call timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// Any other business rejection from the broker.
    #[error("order rejected: {0}")]
    Rejected(String),
}

impl BrokerError {
    /// Whether the retry policy may re-submit the request.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Fatal errors suppress further entries while leaving the safety
    /// layers to manage what is already open.
    #[must_use]
    pub fn is_fatal_for_entries(&self) -> bool {
        matches!(self, Self::NoMoney(_) | Self::InvalidVolume(_))
    }
}

/// Market-open order parameters.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OpenRequest {
    pub symbol: Symbol,
    pub direction: Direction,
    pub volume: Volume,
    /// Protective stop submitted with the order, if any.
    pub stop_loss: Option<Price>,
}

/// Parameters for closing part or all of a position.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CloseRequest {
    pub position_id: PositionId,
    pub symbol: Symbol,
    /// Direction of the position being closed, not of the closing order.
    pub direction: Direction,
    pub volume: Volume,
    pub open_price: Price,
    pub opened_at: DateTime<Utc>,
}

/// Execution report for a filled order.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderFill {
    pub order_id: Uuid,
    pub price: Price,
    pub volume: Volume,
    pub commission: Price,
    pub executed_at: DateTime<Utc>,
}

/// Abstract order executor.
///
/// Implementations must be deterministic in simulation mode; live variants
/// own their transport and credentials.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Human-friendly name used in logs.
    fn name(&self) -> &str;

    /// Immutable contract metadata for the traded symbol.
    fn symbol_info(&self) -> SymbolInfo;

    /// Observe the latest market quote. Simulation prices its fills off this
    /// feed; live gateways have their own market connection and ignore it.
    fn on_quote(&self, _tick: &kawase_core::Tick) {}

    /// Submit a market order; buys fill at the ask, sells at the bid.
    async fn market_open(&self, request: OpenRequest) -> BrokerResult<OrderFill>;

    /// Close `request.volume` of an open position at the current market.
    async fn close(&self, request: CloseRequest) -> BrokerResult<OrderFill>;

    /// Move the protective stop of an open position.
    async fn modify_stop(&self, position_id: PositionId, new_stop: Price) -> BrokerResult<()>;

    /// Latest account state.
    async fn account_info(&self) -> BrokerResult<AccountInfo>;

    /// Dry-run margin check for an intended open.
    async fn can_afford(&self, direction: Direction, volume: Volume) -> BrokerResult<bool>;
}
