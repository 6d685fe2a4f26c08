use async_trait::async_trait;

use crate::{Candle, CloseFill, Fill, InstrumentSpec, OrderRequest, Result, Timeframe, VenuePosition};

/// Abstraction over the order venue.
///
/// `BinanceClient` implements this for live trading.
/// `PaperVenue` implements this for dry runs.
///
/// Only `VenueExecutor` in `crates/engine` should call these methods, so that
/// every call runs under the per-call timeout and order pacing.
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    /// Submit a market entry with its stop-loss / take-profit bracket and
    /// return the fill confirmation. An error means no fill is assumed.
    async fn place_order(&self, order: &OrderRequest) -> Result<Fill>;

    /// Close the whole position on `symbol` at market.
    async fn close_position(&self, symbol: &str) -> Result<CloseFill>;

    /// Positions the venue currently holds open.
    async fn open_positions(&self) -> Result<Vec<VenuePosition>>;

    /// Available balance in quote currency.
    async fn balance(&self) -> Result<f64>;

    /// Quantity constraints, used to round order sizes.
    async fn instrument(&self, symbol: &str) -> Result<InstrumentSpec>;
}

/// Source of OHLCV candles.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// The most recent `count` candles for `symbol`, oldest first. The newest
    /// candle may still be forming.
    async fn candles(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Result<Vec<Candle>>;
}
