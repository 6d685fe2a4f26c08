use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use common::{
    ClosedTrade, Config, Error, ExitReason, OrderRequest, Position, Result, Side, StateStore,
    Timeframe, TradeEvent, VenuePosition,
};
use risk::{compute_levels, size_position};
use strategy::{Analysis, SupertrendStrategy};

use crate::executor::VenueExecutor;
use crate::position::{self, PositionBook};

/// What the trader watches and how much history it pulls.
#[derive(Debug, Clone)]
pub struct TraderSettings {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub lookback: usize,
    pub fetch_concurrency: usize,
}

impl TraderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            symbols: config.symbols.clone(),
            timeframe: config.timeframe,
            lookback: config.lookback,
            fetch_concurrency: config.fetch_concurrency,
        }
    }
}

/// Result of one symbol step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepOutcome {
    pub exit: Option<ExitReason>,
    pub entry: Option<Side>,
    /// Entry signal consumed without an order (risk rejected, position cap,
    /// volatility filter).
    pub skipped: Option<String>,
    /// Venue call failed; the symbol keeps its prior state.
    pub failed: Option<String>,
}

/// Changes made by a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub adopted: Vec<String>,
    pub closed_on_venue: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.adopted.is_empty() && self.closed_on_venue.is_empty()
    }
}

/// Summary of one full cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reconcile: ReconcileReport,
    pub steps: BTreeMap<String, StepOutcome>,
    /// Symbols not evaluated this cycle, with the reason.
    pub skipped: BTreeMap<String, String>,
}

/// Owns the position book and drives every symbol through one cycle:
/// fetch candles, sync with the venue, analyse, step the state machine,
/// persist.
pub struct Trader {
    settings: TraderSettings,
    strategy: SupertrendStrategy,
    executor: VenueExecutor,
    store: Arc<dyn StateStore>,
    book: PositionBook,
    last_price: HashMap<String, f64>,
    /// Adopted positions already alerted for missing levels.
    unprotected: HashSet<String>,
    events: Option<broadcast::Sender<TradeEvent>>,
}

impl Trader {
    pub fn new(
        settings: TraderSettings,
        strategy: SupertrendStrategy,
        executor: VenueExecutor,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let mut book = PositionBook::new();
        for symbol in &settings.symbols {
            book.track(symbol);
        }
        Self {
            settings,
            strategy,
            executor,
            store,
            book,
            last_price: HashMap::new(),
            unprotected: HashSet::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<TradeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.book.open_positions().cloned().collect()
    }

    /// Load the last snapshot. A missing snapshot starts flat.
    pub async fn restore(&mut self) -> Result<()> {
        match self.store.load().await? {
            Some(snapshot) => {
                self.book = PositionBook::from_snapshot(snapshot);
                info!(open = self.book.open_count(), "Restored position book from snapshot");
            }
            None => info!("No snapshot found, starting flat"),
        }
        for symbol in &self.settings.symbols {
            self.book.track(symbol);
        }
        Ok(())
    }

    /// Align the book with what the venue actually holds.
    ///
    /// Venue errors are returned untouched; nothing changes in that case.
    pub async fn reconcile(&mut self) -> Result<ReconcileReport> {
        let venue_positions = self.executor.open_positions().await?;
        let by_symbol: HashMap<&str, &VenuePosition> =
            venue_positions.iter().map(|p| (p.symbol.as_str(), p)).collect();
        let leverage = self.strategy.risk_config().effective_leverage();
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        for symbol in self.settings.symbols.clone() {
            let venue = by_symbol.get(symbol.as_str()).copied();
            let book_side = self.book.get(&symbol).map(|p| p.side);
            match (book_side, venue) {
                (None, Some(v)) => {
                    warn!(symbol = %symbol, side = %v.side, qty = v.quantity, "Adopting venue position");
                    self.book.replace(position::adopt(v, leverage, now));
                    self.emit(TradeEvent::PositionAdopted { symbol: symbol.clone(), side: v.side, quantity: v.quantity });
                    report.adopted.push(symbol);
                }
                (Some(side), Some(v)) if side != v.side => {
                    warn!(symbol = %symbol, book = %side, venue = %v.side, "Side mismatch, venue wins");
                    self.book.replace(position::adopt(v, leverage, now));
                    self.emit(TradeEvent::PositionAdopted { symbol: symbol.clone(), side: v.side, quantity: v.quantity });
                    report.adopted.push(symbol);
                }
                (Some(_), None) => {
                    if self.close_on_venue(&symbol, now).await? {
                        report.closed_on_venue.push(symbol);
                    }
                }
                _ => {}
            }
        }

        let untracked: Vec<&str> = venue_positions
            .iter()
            .map(|p| p.symbol.as_str())
            .filter(|s| !self.settings.symbols.iter().any(|t| t.as_str() == *s))
            .collect();
        if !untracked.is_empty() {
            debug!(?untracked, "Ignoring venue positions on untracked symbols");
        }

        if !report.adopted.is_empty() {
            self.persist().await?;
        }
        Ok(report)
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// One cycle as of `now`. Persistence failures abort the remaining symbols.
    ///
    /// Candles are fetched before reconciling: a paper feed triggers brackets
    /// while it prices the fetch, and the sync must see those closes.
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let started_at = Utc::now();

        let TraderSettings { symbols, timeframe, lookback, fetch_concurrency } = self.settings.clone();
        let executor = &self.executor;
        let fetched: Vec<(String, Result<Vec<common::Candle>>)> = stream::iter(symbols)
            .map(|symbol| async move {
                let candles = executor.candles(&symbol, timeframe, lookback).await;
                (symbol, candles)
            })
            .buffered(fetch_concurrency.max(1))
            .collect()
            .await;
        for (symbol, candles) in &fetched {
            if let Some(last) = candles.as_ref().ok().and_then(|c| c.last()) {
                self.last_price.insert(symbol.clone(), last.close);
            }
        }

        let reconcile = match self.reconcile().await {
            Ok(report) => report,
            Err(e) if e.is_persistence() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Reconciliation failed, stepping the book as it stands");
                ReconcileReport::default()
            }
        };

        let mut steps = BTreeMap::new();
        let mut skipped = BTreeMap::new();

        for (symbol, candles) in fetched {
            let candles = match candles {
                Ok(c) => c,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Candle fetch failed, skipping symbol");
                    skipped.insert(symbol, e.to_string());
                    continue;
                }
            };
            let analysis = match self.strategy.analyze(&candles, timeframe, now) {
                Ok(a) => a,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Cannot evaluate symbol this cycle");
                    skipped.insert(symbol, e.to_string());
                    continue;
                }
            };
            debug!(
                symbol = %symbol,
                close = analysis.close,
                signal = ?analysis.signal,
                direction = ?analysis.direction,
                "Analysed"
            );
            let outcome = self.step(&symbol, &analysis).await?;
            steps.insert(symbol, outcome);
        }

        let report = CycleReport { started_at, finished_at: Utc::now(), reconcile, steps, skipped };
        info!(
            evaluated = report.steps.len(),
            skipped = report.skipped.len(),
            open = self.book.open_count(),
            "Cycle complete"
        );
        Ok(report)
    }

    /// Drive one symbol through the state machine for the newest closed candle.
    ///
    /// Venue failures are reported in the outcome and leave the symbol as it
    /// was. Only persistence failures are returned as errors.
    pub async fn step(&mut self, symbol: &str, a: &Analysis) -> Result<StepOutcome> {
        self.book.track(symbol);
        self.last_price.insert(symbol.to_string(), a.close);
        let risk = self.strategy.risk_config().clone();
        let max_bars = self.strategy.supertrend_config().max_bars_in_trade;
        let mut outcome = StepOutcome::default();
        let mut dirty = false;

        // 1. Levels for adopted positions, then the trailing ratchet.
        let mut stuck = None;
        if let Some(pos) = self.book.get_mut(symbol) {
            if pos.levels_pending {
                match compute_levels(pos.entry_price, pos.side, a.risk_atr, a.tsl_atr, &risk) {
                    Ok(levels) => {
                        position::apply_levels(pos, &levels);
                        info!(symbol = %symbol, sl = pos.stop_loss, tp = pos.take_profit, "Levels set for adopted position");
                        dirty = true;
                    }
                    Err(e) => stuck = Some(e.to_string()),
                }
            }
            if position::ratchet(pos, a.close, a.candle_id) {
                debug!(symbol = %symbol, hfp = pos.highest_favorable_price, tsl = pos.trailing_stop, "Ratchet");
                dirty = true;
            }
        }
        match stuck {
            // Alert once per position; it stays unprotected until levels resolve.
            Some(error) if self.unprotected.insert(symbol.to_string()) => {
                error!(symbol = %symbol, error = %error, "Adopted position has no levels, engine exits disabled");
                self.emit(TradeEvent::Unprotected { symbol: symbol.to_string(), error });
            }
            Some(error) => debug!(symbol = %symbol, error = %error, "Adopted position still without levels"),
            None => {
                self.unprotected.remove(symbol);
            }
        }

        // 2. Protective exits.
        let exit = self
            .book
            .get(symbol)
            .and_then(|pos| position::exit_reason(pos, a.close, risk.engine_take_profit, max_bars));
        if let Some(reason) = exit {
            match self.close(symbol, reason).await? {
                Ok(closed) => {
                    outcome.exit = Some(closed);
                    dirty = false;
                }
                Err(e) => {
                    outcome.failed = Some(e.to_string());
                    return self.finish(outcome, dirty).await;
                }
            }
        }

        let Some(side) = a.signal.side() else {
            return self.finish(outcome, dirty).await;
        };
        if self.book.is_consumed(symbol, a.candle_id) {
            return self.finish(outcome, dirty).await;
        }

        // 3. Opposite signal closes; a same-direction signal is consumed.
        if let Some(open_side) = self.book.get(symbol).map(|p| p.side) {
            if open_side == side {
                debug!(symbol = %symbol, side = %side, "Signal matches open position");
                self.book.consume_signal(symbol, a.candle_id);
                return self.finish(outcome, true).await;
            }
            match self.close(symbol, ExitReason::OppositeSignal).await? {
                Ok(closed) => {
                    outcome.exit = Some(closed);
                    dirty = false;
                }
                Err(e) => {
                    outcome.failed = Some(e.to_string());
                    return self.finish(outcome, dirty).await;
                }
            }
        }

        // 4. Entry from flat.
        if a.filtered {
            info!(symbol = %symbol, side = %side, "Flip below median volatility, entry skipped");
            outcome.skipped = Some("volatility filter".into());
            self.book.consume_signal(symbol, a.candle_id);
            return self.finish(outcome, true).await;
        }
        if self.book.open_count() >= risk.max_positions {
            info!(symbol = %symbol, max = risk.max_positions, "Position cap reached, signal skipped");
            outcome.skipped = Some(format!("max_positions {} reached", risk.max_positions));
            self.book.consume_signal(symbol, a.candle_id);
            return self.finish(outcome, true).await;
        }

        match self.enter(symbol, side, a).await {
            Ok(()) => outcome.entry = Some(side),
            Err(e @ Error::InvalidRisk(_)) => {
                warn!(symbol = %symbol, error = %e, "Entry skipped");
                outcome.skipped = Some(e.to_string());
                self.book.consume_signal(symbol, a.candle_id);
            }
            Err(e) if e.is_persistence() => return Err(e),
            Err(e) => {
                error!(symbol = %symbol, error = %e, "Entry failed, will retry next cycle");
                self.emit(TradeEvent::OrderFailed { symbol: symbol.to_string(), error: e.to_string() });
                outcome.failed = Some(e.to_string());
                return self.finish(outcome, dirty).await;
            }
        }
        self.finish(outcome, true).await
    }

    /// Size, place and record an entry. The signal is consumed only on a fill.
    async fn enter(&mut self, symbol: &str, side: Side, a: &Analysis) -> Result<()> {
        let risk = self.strategy.risk_config();
        let levels = compute_levels(a.close, side, a.risk_atr, a.tsl_atr, risk)?;
        let balance = self.executor.balance().await?;
        let spec = self.executor.instrument(symbol).await?;
        let sizing = size_position(balance, a.close, risk, |q| spec.round_quantity(q))?;

        let order = OrderRequest::market(
            symbol,
            side,
            sizing.quantity,
            levels.stop_loss,
            levels.take_profit,
            sizing.leverage,
        );
        let fill = self.executor.place_order(&order).await?;

        let pos = position::open_from_fill(&fill, &levels, sizing.leverage, a.candle_id);
        info!(
            symbol = %symbol,
            side = %side,
            price = fill.fill_price,
            qty = fill.quantity,
            sl = pos.stop_loss,
            tp = pos.take_profit,
            tsl = pos.trailing_stop,
            "Position opened"
        );
        self.book.open(pos.clone())?;
        self.book.consume_signal(symbol, a.candle_id);
        self.persist().await?;
        self.emit(TradeEvent::PositionOpened {
            symbol: symbol.to_string(),
            side,
            price: fill.fill_price,
            quantity: fill.quantity,
            stop_loss: pos.stop_loss,
            take_profit: pos.take_profit,
        });
        Ok(())
    }

    /// Close the open position on `symbol` and return the reason recorded.
    ///
    /// The outer `Result` carries persistence failures, the inner one the
    /// venue outcome. A failed close whose symbol turns out to be flat on the
    /// venue (a bracket filled first) is booked as `ClosedOnVenue`. Any other
    /// venue failure leaves the position open.
    async fn close(&mut self, symbol: &str, reason: ExitReason) -> Result<Result<ExitReason>> {
        let fill = match self.executor.close_position(symbol).await {
            Ok(fill) => fill,
            Err(e) => {
                if self.venue_is_flat(symbol).await {
                    warn!(symbol = %symbol, reason = %reason, error = %e, "Close refused, venue already flat");
                    self.close_on_venue(symbol, Utc::now()).await?;
                    return Ok(Ok(ExitReason::ClosedOnVenue));
                }
                error!(symbol = %symbol, reason = %reason, error = %e, "Close failed, position kept");
                self.emit(TradeEvent::OrderFailed { symbol: symbol.to_string(), error: e.to_string() });
                return Ok(Err(e));
            }
        };
        let Some(pos) = self.book.close(symbol) else {
            return Ok(Ok(reason));
        };
        let trade = ClosedTrade::from_position(&pos, fill.fill_price, reason, fill.timestamp);
        info!(
            symbol = %symbol,
            side = %pos.side,
            price = fill.fill_price,
            pnl = trade.pnl,
            reason = %reason,
            "Position closed"
        );
        self.persist().await?;
        self.store.record_trade(&trade).await?;
        self.emit(TradeEvent::PositionClosed {
            symbol: symbol.to_string(),
            side: pos.side,
            price: fill.fill_price,
            pnl: trade.pnl,
            reason,
        });
        Ok(Ok(reason))
    }

    /// True only when the venue answers and holds nothing on `symbol`.
    async fn venue_is_flat(&self, symbol: &str) -> bool {
        match self.executor.open_positions().await {
            Ok(positions) => !positions.iter().any(|p| p.symbol == symbol),
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "Cannot confirm venue position");
                false
            }
        }
    }

    /// Book a position the venue already closed, at the last seen price.
    /// Returns false when the book held nothing on `symbol`.
    async fn close_on_venue(&mut self, symbol: &str, now: DateTime<Utc>) -> Result<bool> {
        let Some(pos) = self.book.close(symbol) else {
            return Ok(false);
        };
        let exit = self.last_price.get(symbol).copied().unwrap_or(pos.entry_price);
        info!(symbol = %symbol, price = exit, "Position closed on venue");
        let trade = ClosedTrade::from_position(&pos, exit, ExitReason::ClosedOnVenue, now);
        self.persist().await?;
        self.store.record_trade(&trade).await?;
        self.emit(TradeEvent::PositionClosed {
            symbol: symbol.to_string(),
            side: pos.side,
            price: exit,
            pnl: trade.pnl,
            reason: ExitReason::ClosedOnVenue,
        });
        Ok(true)
    }

    async fn finish(&self, outcome: StepOutcome, dirty: bool) -> Result<StepOutcome> {
        if dirty {
            self.persist().await?;
        }
        Ok(outcome)
    }

    async fn persist(&self) -> Result<()> {
        self.store.save(&self.book.to_snapshot()).await.map_err(|e| {
            error!(error = %e, "Failed to persist position book");
            e
        })
    }

    fn emit(&self, event: TradeEvent) {
        if let Some(tx) = &self.events {
            // No subscribers is fine.
            let _ = tx.send(event);
        }
    }
}
