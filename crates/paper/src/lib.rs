mod feed;

pub use feed::PaperFeed;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use common::{
    CloseFill, Error, ExecutionVenue, Fill, InstrumentSpec, OrderRequest, Result, Side,
    VenuePosition,
};

/// A simulated position plus the bracket the live venue would hold for it.
#[derive(Debug, Clone)]
struct PaperPosition {
    position: VenuePosition,
    stop_loss: f64,
    take_profit: f64,
}

/// Simulated execution venue for dry runs.
///
/// Fills are simulated at the latest known price with configurable slippage.
/// Entry brackets are honoured on every price update, the way the exchange
/// would trigger its stop-market and take-profit-market orders.
/// No real orders are ever sent.
pub struct PaperVenue {
    /// Simulated balance in quote currency. Realised PnL is added on close.
    balance: RwLock<f64>,
    positions: RwLock<HashMap<String, PaperPosition>>,
    /// Latest known price per symbol, updated via `update_price`.
    prices: RwLock<HashMap<String, f64>>,
    /// Slippage in basis points applied to all fills.
    slippage_bps: f64,
    spec: InstrumentSpec,
}

impl PaperVenue {
    pub fn new(initial_balance: f64, slippage_bps: f64) -> Self {
        info!(balance = initial_balance, slippage_bps, "PaperVenue initialized");
        Self {
            balance: RwLock::new(initial_balance),
            positions: RwLock::new(HashMap::new()),
            prices: RwLock::new(HashMap::new()),
            slippage_bps,
            spec: InstrumentSpec::default(),
        }
    }

    /// Record the latest price for `symbol` and trigger any bracket it crosses.
    /// Returns the symbols whose positions were closed by a bracket.
    pub async fn update_price(&self, symbol: &str, price: f64) -> Vec<String> {
        self.prices.write().await.insert(symbol.to_string(), price);

        let mut positions = self.positions.write().await;
        let Some(held) = positions.get(symbol) else {
            return Vec::new();
        };
        let triggered = match held.position.side {
            Side::Long => price <= held.stop_loss || price >= held.take_profit,
            Side::Short => price >= held.stop_loss || price <= held.take_profit,
        };
        if !triggered {
            return Vec::new();
        }
        let Some(held) = positions.remove(symbol) else {
            return Vec::new();
        };
        drop(positions);

        let fill_price = self.slipped(price, held.position.side.opposite());
        let pnl = self.settle(&held.position, fill_price).await;
        info!(
            symbol = %symbol,
            price = fill_price,
            sl = held.stop_loss,
            tp = held.take_profit,
            pnl,
            "Paper bracket triggered"
        );
        vec![symbol.to_string()]
    }

    async fn price(&self, symbol: &str) -> Result<f64> {
        self.prices.read().await.get(symbol).copied().ok_or_else(|| {
            Error::Venue(format!(
                "PaperVenue has no price for '{symbol}'. Fetch candles before trading it."
            ))
        })
    }

    /// Buys pay more, sells receive less.
    fn slipped(&self, mid: f64, side: Side) -> f64 {
        mid * (1.0 + side.sign() * self.slippage_bps / 10_000.0)
    }

    async fn settle(&self, position: &VenuePosition, exit_price: f64) -> f64 {
        let pnl = (exit_price - position.entry_price) * position.side.sign() * position.quantity;
        *self.balance.write().await += pnl;
        pnl
    }
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    async fn place_order(&self, order: &OrderRequest) -> Result<Fill> {
        let mid = self.price(&order.symbol).await?;

        let mut positions = self.positions.write().await;
        if positions.contains_key(&order.symbol) {
            return Err(Error::Venue(format!("{} already has an open position", order.symbol)));
        }

        let fill_price = self.slipped(mid, order.side);
        debug!(
            symbol = %order.symbol,
            side = %order.side,
            mid,
            fill = fill_price,
            qty = order.quantity,
            "Paper fill simulated"
        );

        positions.insert(
            order.symbol.clone(),
            PaperPosition {
                position: VenuePosition {
                    symbol: order.symbol.clone(),
                    side: order.side,
                    entry_price: fill_price,
                    quantity: order.quantity,
                    mark_price: Some(mid),
                },
                stop_loss: order.stop_loss,
                take_profit: order.take_profit,
            },
        );

        Ok(Fill {
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            fill_price,
            quantity: order.quantity,
            timestamp: Utc::now(),
        })
    }

    async fn close_position(&self, symbol: &str) -> Result<CloseFill> {
        let mid = self.price(symbol).await?;
        let held = self
            .positions
            .write()
            .await
            .remove(symbol)
            .ok_or_else(|| Error::Venue(format!("No open paper position on {symbol}")))?;

        let fill_price = self.slipped(mid, held.position.side.opposite());
        let pnl = self.settle(&held.position, fill_price).await;
        debug!(symbol = %symbol, fill = fill_price, pnl, "Paper close simulated");

        Ok(CloseFill { symbol: symbol.to_string(), fill_price, timestamp: Utc::now() })
    }

    async fn open_positions(&self) -> Result<Vec<VenuePosition>> {
        let prices = self.prices.read().await;
        Ok(self
            .positions
            .read()
            .await
            .values()
            .map(|held| VenuePosition {
                mark_price: prices.get(&held.position.symbol).copied(),
                ..held.position.clone()
            })
            .collect())
    }

    async fn balance(&self) -> Result<f64> {
        Ok(*self.balance.read().await)
    }

    async fn instrument(&self, _symbol: &str) -> Result<InstrumentSpec> {
        Ok(self.spec)
    }
}
