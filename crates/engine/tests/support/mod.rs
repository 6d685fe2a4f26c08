#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use common::{
    Candle, CloseFill, ClosedTrade, Error, ExecutionVenue, Fill, InstrumentSpec, MarketData,
    OrderRequest, Result, Side, Signal, Snapshot, StateStore, Timeframe, VenuePosition,
};
use engine::{CallPolicy, Trader, TraderSettings, VenueExecutor};
use strategy::{Analysis, StrategyFileConfig, SupertrendStrategy, Trend};

// ─── Mock venue ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct VenueState {
    /// Price used for every fill.
    pub price: f64,
    pub balance: f64,
    pub spec: InstrumentSpec,
    pub positions: HashMap<String, VenuePosition>,
    /// Order-side calls in order: "open BTCUSDT long", "close BTCUSDT".
    pub orders: Vec<String>,
    pub fail_orders: bool,
    pub fail_reads: bool,
    /// Set when an entry arrives while the symbol already has a position.
    pub double_open: bool,
    pub candles: HashMap<String, Vec<Candle>>,
}

pub struct MockVenue {
    pub state: Mutex<VenueState>,
}

impl MockVenue {
    pub fn new(price: f64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(VenueState {
                price,
                balance: 10_000.0,
                spec: InstrumentSpec::default(),
                positions: HashMap::new(),
                orders: Vec::new(),
                fail_orders: false,
                fail_reads: false,
                double_open: false,
                candles: HashMap::new(),
            }),
        })
    }

    pub fn set_price(&self, price: f64) {
        self.state.lock().unwrap().price = price;
    }

    pub fn orders(&self) -> Vec<String> {
        self.state.lock().unwrap().orders.clone()
    }

    pub fn position(&self, symbol: &str) -> Option<VenuePosition> {
        self.state.lock().unwrap().positions.get(symbol).cloned()
    }
}

#[async_trait]
impl ExecutionVenue for MockVenue {
    async fn place_order(&self, order: &OrderRequest) -> Result<Fill> {
        let mut s = self.state.lock().unwrap();
        s.orders.push(format!("open {} {}", order.symbol, order.side));
        if s.fail_orders {
            return Err(Error::Venue("order rejected".into()));
        }
        if s.positions.contains_key(&order.symbol) {
            s.double_open = true;
        }
        let price = s.price;
        s.positions.insert(
            order.symbol.clone(),
            VenuePosition {
                symbol: order.symbol.clone(),
                side: order.side,
                entry_price: price,
                quantity: order.quantity,
                mark_price: Some(price),
            },
        );
        Ok(Fill {
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            fill_price: price,
            quantity: order.quantity,
            timestamp: Utc::now(),
        })
    }

    async fn close_position(&self, symbol: &str) -> Result<CloseFill> {
        let mut s = self.state.lock().unwrap();
        s.orders.push(format!("close {symbol}"));
        if s.fail_orders {
            return Err(Error::Venue("close rejected".into()));
        }
        if s.positions.remove(symbol).is_none() {
            return Err(Error::Venue(format!("no position on {symbol}")));
        }
        Ok(CloseFill { symbol: symbol.to_string(), fill_price: s.price, timestamp: Utc::now() })
    }

    async fn open_positions(&self) -> Result<Vec<VenuePosition>> {
        let s = self.state.lock().unwrap();
        if s.fail_reads {
            return Err(Error::Venue("positions unavailable".into()));
        }
        Ok(s.positions.values().cloned().collect())
    }

    async fn balance(&self) -> Result<f64> {
        let s = self.state.lock().unwrap();
        if s.fail_reads {
            return Err(Error::Venue("balance unavailable".into()));
        }
        Ok(s.balance)
    }

    async fn instrument(&self, _symbol: &str) -> Result<InstrumentSpec> {
        Ok(self.state.lock().unwrap().spec)
    }
}

#[async_trait]
impl MarketData for MockVenue {
    async fn candles(&self, symbol: &str, _timeframe: Timeframe, count: usize) -> Result<Vec<Candle>> {
        let s = self.state.lock().unwrap();
        let candles = s
            .candles
            .get(symbol)
            .ok_or_else(|| Error::InvalidSymbol(symbol.to_string()))?;
        let start = candles.len().saturating_sub(count);
        Ok(candles[start..].to_vec())
    }
}

// ─── In-memory store ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    pub snapshot: Mutex<Option<Snapshot>>,
    pub trades: Mutex<Vec<ClosedTrade>>,
    pub fail_saves: AtomicBool,
    pub saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn saved(&self) -> Option<Snapshot> {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn trades(&self) -> Vec<ClosedTrade> {
        self.trades.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }

    pub fn fail(&self, on: bool) {
        self.fail_saves.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.saved())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::Persistence("disk full".into()));
        }
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }

    async fn record_trade(&self, trade: &ClosedTrade) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::Persistence("disk full".into()));
        }
        self.trades.lock().unwrap().push(trade.clone());
        Ok(())
    }
}

// ─── Builders ─────────────────────────────────────────────────────────────────

pub fn make_config() -> StrategyFileConfig {
    let mut config = StrategyFileConfig::default();
    config.supertrend.atr_period = 5;
    config.supertrend.factor = 1.0;
    config.risk.risk_atr_len = 5;
    config.risk.tsl_atr_len = 5;
    config.risk.risk_atr_mult = 2.0;
    config.risk.tsl_mult = 2.0;
    config.risk.tp_rr = 2.0;
    config
}

pub fn make_trader_with(
    venue: &Arc<MockVenue>,
    store: &Arc<MemoryStore>,
    symbols: &[&str],
    config: StrategyFileConfig,
) -> Trader {
    let settings = TraderSettings {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        timeframe: Timeframe::from_minutes(15),
        lookback: 200,
        fetch_concurrency: 4,
    };
    let executor = VenueExecutor::new(venue.clone(), venue.clone(), CallPolicy::default());
    Trader::new(settings, SupertrendStrategy::new(config), executor, store.clone())
}

pub fn make_trader(venue: &Arc<MockVenue>, store: &Arc<MemoryStore>) -> Trader {
    make_trader_with(venue, store, &["BTCUSDT"], make_config())
}

/// Analysis for candle `id` closing at `close` with the given signal and ATR.
pub fn view(signal: Signal, id: i64, close: f64, atr: f64) -> Analysis {
    Analysis {
        signal,
        candle_id: id,
        candle_time: Utc.timestamp_millis_opt(id).unwrap(),
        close,
        risk_atr: atr,
        tsl_atr: atr,
        direction: match signal {
            Signal::EnterShort => Trend::Down,
            _ => Trend::Up,
        },
        filtered: false,
    }
}

pub fn venue_long(symbol: &str, entry: f64, mark: Option<f64>) -> VenuePosition {
    VenuePosition {
        symbol: symbol.to_string(),
        side: Side::Long,
        entry_price: entry,
        quantity: 1.0,
        mark_price: mark,
    }
}

/// `count` flat candles at `price` followed by `tail` closes, 15 minutes apart.
pub fn make_candles(count: usize, price: f64, tail: &[f64]) -> Vec<Candle> {
    std::iter::repeat(price)
        .take(count)
        .chain(tail.iter().copied())
        .enumerate()
        .map(|(i, c)| Candle {
            timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64 * 900, 0).unwrap(),
            open: c,
            high: c + 1.0,
            low: c - 1.0,
            close: c,
            volume: 1.0,
        })
        .collect()
}
