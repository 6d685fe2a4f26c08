use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use common::{
    Candle, CloseFill, Config, Error, ExecutionVenue, Fill, InstrumentSpec, MarketData,
    OrderRequest, Result, Timeframe, VenuePosition,
};

/// Timeouts, retries and order pacing applied to every collaborator call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallPolicy {
    pub call_timeout: Duration,
    /// Extra attempts for read-only calls. Orders are never retried.
    pub max_retries: u32,
    /// First backoff delay; doubles on each retry.
    pub retry_base: Duration,
    /// Minimum spacing between consecutive order calls.
    pub order_delay: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_base: Duration::from_millis(500),
            order_delay: Duration::ZERO,
        }
    }
}

impl CallPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            call_timeout: config.call_timeout,
            max_retries: config.max_retries,
            order_delay: config.order_delay,
            ..Self::default()
        }
    }
}

/// The only caller of [`MarketData`] and [`ExecutionVenue`].
pub struct VenueExecutor {
    market: Arc<dyn MarketData>,
    venue: Arc<dyn ExecutionVenue>,
    policy: CallPolicy,
    last_order_at: Mutex<Option<Instant>>,
}

impl VenueExecutor {
    pub fn new(market: Arc<dyn MarketData>, venue: Arc<dyn ExecutionVenue>, policy: CallPolicy) -> Self {
        Self { market, venue, policy, last_order_at: Mutex::new(None) }
    }

    // ─── Read-only calls (timeout + retry) ────────────────────────────────────

    pub async fn candles(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Result<Vec<Candle>> {
        self.read("candles", || self.market.candles(symbol, timeframe, count)).await
    }

    pub async fn open_positions(&self) -> Result<Vec<VenuePosition>> {
        self.read("open_positions", || self.venue.open_positions()).await
    }

    pub async fn balance(&self) -> Result<f64> {
        self.read("balance", || self.venue.balance()).await
    }

    pub async fn instrument(&self, symbol: &str) -> Result<InstrumentSpec> {
        self.read("instrument", || self.venue.instrument(symbol)).await
    }

    // ─── Order calls (timeout + pacing, single attempt) ───────────────────────

    pub async fn place_order(&self, order: &OrderRequest) -> Result<Fill> {
        self.pace().await;
        info!(
            symbol = %order.symbol,
            side = %order.side,
            qty = order.quantity,
            sl = order.stop_loss,
            tp = order.take_profit,
            leverage = order.leverage,
            "Placing entry order"
        );
        let result = self.timed("place_order", self.venue.place_order(order)).await;
        self.mark_order().await;
        result
    }

    pub async fn close_position(&self, symbol: &str) -> Result<CloseFill> {
        self.pace().await;
        info!(symbol = %symbol, "Closing position");
        let result = self.timed("close_position", self.venue.close_position(symbol)).await;
        self.mark_order().await;
        result
    }

    async fn timed<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.policy.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("{what} exceeded {:?}", self.policy.call_timeout))),
        }
    }

    async fn read<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match self.timed(what, call()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    let delay = self.policy.retry_base * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(call = what, attempt, error = %e, delay = ?delay, "Retrying read-only call");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn pace(&self) {
        if self.policy.order_delay.is_zero() {
            return;
        }
        let last = *self.last_order_at.lock().await;
        if let Some(at) = last {
            let elapsed = at.elapsed();
            if elapsed < self.policy.order_delay {
                tokio::time::sleep(self.policy.order_delay - elapsed).await;
            }
        }
    }

    async fn mark_order(&self) {
        *self.last_order_at.lock().await = Some(Instant::now());
    }
}
