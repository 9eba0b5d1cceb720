//! Deterministic in-memory gateway used by tests and backtests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use kawase_core::{
    pips_to_price, AccountInfo, Direction, PositionId, Price, SymbolInfo, Tick, Volume,
};

use crate::{BrokerError, BrokerGateway, BrokerResult, CloseRequest, OpenRequest, OrderFill};

/// Simulation parameters. All values default to frictionless fills.
#[derive(Clone, Debug)]
pub struct SimulatedGatewayConfig {
    pub initial_balance: Price,
    /// Adverse slippage applied to every fill, in pips.
    pub slippage_pips: Decimal,
    /// Commission charged per 1.0 lot per fill, in account currency.
    pub commission_per_lot: Price,
    /// Overnight swap per 1.0 lot per whole day held, in account currency.
    pub swap_per_lot_per_day: Price,
    /// Fraction of notional reserved as margin on open positions.
    pub margin_rate: Decimal,
}

impl Default for SimulatedGatewayConfig {
    fn default() -> Self {
        Self {
            initial_balance: Decimal::from(1_000_000),
            slippage_pips: Decimal::ZERO,
            commission_per_lot: Decimal::ZERO,
            swap_per_lot_per_day: Decimal::ZERO,
            margin_rate: Decimal::new(4, 2),
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    quote: Option<Tick>,
    balance: Price,
    used_margin: Price,
    requotes_remaining: u32,
    close_failures_remaining: u32,
    no_money: bool,
    stops: Vec<(PositionId, Price)>,
}

/// Fills orders immediately at the current quote: buys at the ask,
/// sell-closes at the bid, with configured slippage, commission and swap.
pub struct SimulatedGateway {
    cfg: SimulatedGatewayConfig,
    info: SymbolInfo,
    state: Mutex<SimState>,
}

impl SimulatedGateway {
    pub fn new(info: SymbolInfo, cfg: SimulatedGatewayConfig) -> Self {
        let state = SimState {
            balance: cfg.initial_balance,
            ..SimState::default()
        };
        Self {
            cfg,
            info,
            state: Mutex::new(state),
        }
    }

    /// Feed the latest market quote; fills price off this tick.
    pub fn update_quote(&self, tick: Tick) {
        self.lock().quote = Some(tick);
    }

    /// Make the next `count` orders bounce with a requote.
    pub fn inject_requotes(&self, count: u32) {
        self.lock().requotes_remaining = count;
    }

    /// Make the next `count` close orders fail outright.
    pub fn inject_close_failures(&self, count: u32) {
        self.lock().close_failures_remaining = count;
    }

    /// Toggle the no-money rejection for new opens.
    pub fn set_no_money(&self, enabled: bool) {
        self.lock().no_money = enabled;
    }

    /// Stops recorded through `modify_stop`, for assertions.
    pub fn recorded_stops(&self) -> Vec<(PositionId, Price)> {
        self.lock().stops.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("simulated gateway state poisoned")
    }

    fn slippage_price(&self) -> Price {
        pips_to_price(self.cfg.slippage_pips, self.info.pip_scale)
    }

    fn quote_or_err(state: &SimState) -> BrokerResult<Tick> {
        state
            .quote
            .clone()
            .ok_or_else(|| BrokerError::Transport("no market quote available".into()))
    }

    fn margin_for(&self, volume: Volume, price: Price) -> Price {
        volume * self.info.contract_size * price * self.cfg.margin_rate
    }

    fn whole_days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        (to - from).num_days().max(0)
    }
}

#[async_trait]
impl BrokerGateway for SimulatedGateway {
    fn name(&self) -> &str {
        "simulated"
    }

    fn symbol_info(&self) -> SymbolInfo {
        self.info.clone()
    }

    fn on_quote(&self, tick: &Tick) {
        self.update_quote(tick.clone());
    }

    async fn market_open(&self, request: OpenRequest) -> BrokerResult<OrderFill> {
        let mut state = self.lock();
        if state.requotes_remaining > 0 {
            state.requotes_remaining -= 1;
            return Err(BrokerError::Transient("requote".into()));
        }
        if state.no_money {
            return Err(BrokerError::NoMoney("simulated margin exhausted".into()));
        }
        if request.volume < self.info.volume_min || request.volume > self.info.volume_max {
            return Err(BrokerError::InvalidVolume(format!(
                "volume {} outside [{}, {}]",
                request.volume, self.info.volume_min, self.info.volume_max
            )));
        }
        let quote = Self::quote_or_err(&state)?;
        let slip = self.slippage_price();
        let price = match request.direction {
            Direction::Buy => quote.ask + slip,
            Direction::Sell => quote.bid - slip,
        };
        let commission = self.cfg.commission_per_lot * request.volume;
        state.balance -= commission;
        state.used_margin += self.margin_for(request.volume, price);
        info!(
            symbol = %request.symbol,
            direction = %request.direction,
            volume = %request.volume,
            %price,
            "simulated order filled"
        );
        Ok(OrderFill {
            order_id: Uuid::new_v4(),
            price,
            volume: request.volume,
            commission,
            executed_at: quote.time,
        })
    }

    async fn close(&self, request: CloseRequest) -> BrokerResult<OrderFill> {
        let mut state = self.lock();
        if state.close_failures_remaining > 0 {
            state.close_failures_remaining -= 1;
            return Err(BrokerError::Rejected("simulated close failure".into()));
        }
        if state.requotes_remaining > 0 {
            state.requotes_remaining -= 1;
            return Err(BrokerError::Transient("requote".into()));
        }
        let quote = Self::quote_or_err(&state)?;
        let slip = self.slippage_price();
        // Closing a long sells at the bid; closing a short buys at the ask.
        let price = match request.direction {
            Direction::Buy => quote.bid - slip,
            Direction::Sell => quote.ask + slip,
        };
        let realized = request.direction.favourable_delta(request.open_price, price)
            * request.volume
            * self.info.contract_size;
        let commission = self.cfg.commission_per_lot * request.volume;
        let swap = self.cfg.swap_per_lot_per_day
            * request.volume
            * Decimal::from(Self::whole_days_between(request.opened_at, quote.time));
        state.balance += realized - commission - swap;
        state.used_margin =
            (state.used_margin - self.margin_for(request.volume, request.open_price)).max(Decimal::ZERO);
        state.stops.retain(|(id, _)| *id != request.position_id);
        info!(
            position = %request.position_id,
            volume = %request.volume,
            %price,
            %realized,
            "simulated close filled"
        );
        Ok(OrderFill {
            order_id: Uuid::new_v4(),
            price,
            volume: request.volume,
            commission,
            executed_at: quote.time,
        })
    }

    async fn modify_stop(&self, position_id: PositionId, new_stop: Price) -> BrokerResult<()> {
        let mut state = self.lock();
        if let Some(slot) = state.stops.iter_mut().find(|(id, _)| *id == position_id) {
            slot.1 = new_stop;
        } else {
            state.stops.push((position_id, new_stop));
        }
        Ok(())
    }

    async fn account_info(&self) -> BrokerResult<AccountInfo> {
        let state = self.lock();
        Ok(AccountInfo {
            currency: "JPY".into(),
            balance: state.balance,
            // Unrealized PnL is tracked by the position book, not here.
            equity: state.balance,
            margin_free: (state.balance - state.used_margin).max(Decimal::ZERO),
        })
    }

    async fn can_afford(&self, _direction: Direction, volume: Volume) -> BrokerResult<bool> {
        let state = self.lock();
        let quote = Self::quote_or_err(&state)?;
        let required = self.margin_for(volume, quote.mid());
        Ok(state.balance - state.used_margin >= required)
    }
}
