//! Retry and call-budget policy wrapped around any gateway.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tracing::warn;

use kawase_core::{AccountInfo, Direction, PositionId, Price, SymbolInfo, Volume};

use crate::{BrokerError, BrokerGateway, BrokerResult, CloseRequest, OpenRequest, OrderFill};

/// Wraps a gateway with bounded calls and transient-error retries.
///
/// Requotes and price-off rejections are retried up to `max_attempts` with a
/// fixed backoff; every attempt is bounded by `call_timeout` and an elapsed
/// budget converts into [`BrokerError::Timeout`].
pub struct RetryingGateway<G> {
    inner: G,
    max_attempts: u32,
    backoff: Duration,
    call_timeout: Duration,
}

impl<G: BrokerGateway> RetryingGateway<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            max_attempts: 3,
            backoff: Duration::from_secs(1),
            call_timeout: Duration::from_secs(2),
        }
    }

    /// Override the retry cadence (used by fast simulation runs).
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    #[must_use]
    pub fn inner(&self) -> &G {
        &self.inner
    }
}

#[async_trait]
impl<G: BrokerGateway> BrokerGateway for RetryingGateway<G> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn symbol_info(&self) -> SymbolInfo {
        self.inner.symbol_info()
    }

    fn on_quote(&self, tick: &kawase_core::Tick) {
        self.inner.on_quote(tick);
    }

    async fn market_open(&self, request: OpenRequest) -> BrokerResult<OrderFill> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match timeout(self.call_timeout, self.inner.market_open(request.clone())).await {
                Ok(Ok(fill)) => return Ok(fill),
                Ok(Err(err)) if err.is_transient() && attempt < self.max_attempts => {
                    warn!(%err, attempt, "open rejected, retrying");
                    sleep(self.backoff).await;
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(BrokerError::Timeout(self.call_timeout)),
            }
        }
    }

    async fn close(&self, request: CloseRequest) -> BrokerResult<OrderFill> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match timeout(self.call_timeout, self.inner.close(request.clone())).await {
                Ok(Ok(fill)) => return Ok(fill),
                Ok(Err(err)) if err.is_transient() && attempt < self.max_attempts => {
                    warn!(%err, attempt, position = %request.position_id, "close rejected, retrying");
                    sleep(self.backoff).await;
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(BrokerError::Timeout(self.call_timeout)),
            }
        }
    }

    async fn modify_stop(&self, position_id: PositionId, new_stop: Price) -> BrokerResult<()> {
        match timeout(self.call_timeout, self.inner.modify_stop(position_id, new_stop)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(self.call_timeout)),
        }
    }

    async fn account_info(&self) -> BrokerResult<AccountInfo> {
        match timeout(self.call_timeout, self.inner.account_info()).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(self.call_timeout)),
        }
    }

    async fn can_afford(&self, direction: Direction, volume: Volume) -> BrokerResult<bool> {
        match timeout(self.call_timeout, self.inner.can_afford(direction, volume)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(self.call_timeout)),
        }
    }
}
