use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use common::{Candle, MarketData, Result, Timeframe};

use crate::PaperVenue;

/// Market data decorator for dry runs.
///
/// Candles come from the real feed; the newest close of every fetch is pushed
/// to the paper venue as its current price.
pub struct PaperFeed {
    inner: Arc<dyn MarketData>,
    venue: Arc<PaperVenue>,
}

impl PaperFeed {
    pub fn new(inner: Arc<dyn MarketData>, venue: Arc<PaperVenue>) -> Self {
        Self { inner, venue }
    }
}

#[async_trait]
impl MarketData for PaperFeed {
    async fn candles(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Result<Vec<Candle>> {
        let candles = self.inner.candles(symbol, timeframe, count).await?;
        if let Some(last) = candles.last() {
            let closed = self.venue.update_price(symbol, last.close).await;
            if !closed.is_empty() {
                debug!(symbol = %symbol, price = last.close, "Paper bracket filled during fetch");
            }
        }
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::{Error, ExecutionVenue, OrderRequest, Side};

    struct FixedFeed(Vec<Candle>);

    #[async_trait]
    impl MarketData for FixedFeed {
        async fn candles(&self, symbol: &str, _tf: Timeframe, _count: usize) -> Result<Vec<Candle>> {
            if symbol != "BTCUSDT" {
                return Err(Error::InvalidSymbol(symbol.to_string()));
            }
            Ok(self.0.clone())
        }
    }

    fn make_candle(close: f64) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[tokio::test]
    async fn fetch_sets_paper_price() {
        let venue = Arc::new(PaperVenue::new(1_000.0, 0.0));
        let feed = PaperFeed::new(Arc::new(FixedFeed(vec![make_candle(90.0), make_candle(95.0)])), venue.clone());

        let candles = feed.candles("BTCUSDT", Timeframe::from_minutes(15), 2).await.unwrap();
        assert_eq!(candles.len(), 2);

        let order = OrderRequest::market("BTCUSDT", Side::Long, 1.0, 80.0, 120.0, 1);
        let fill = venue.place_order(&order).await.unwrap();
        assert_eq!(fill.fill_price, 95.0);
    }

    #[tokio::test]
    async fn inner_errors_pass_through() {
        let venue = Arc::new(PaperVenue::new(1_000.0, 0.0));
        let feed = PaperFeed::new(Arc::new(FixedFeed(Vec::new())), venue);

        let err = feed.candles("FOOUSDT", Timeframe::from_minutes(15), 2).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSymbol(_)));
    }
}
