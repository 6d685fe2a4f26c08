use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use common::{
    Error, ExitReason, Fill, Position, PositionStatus, Result, Side, Snapshot, VenuePosition,
    SCHEMA_VERSION,
};
use risk::RiskLevels;

/// In-memory position book: one slot per symbol plus the id of the last
/// candle whose signal was consumed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionBook {
    positions: BTreeMap<String, Option<Position>>,
    last_signal: BTreeMap<String, i64>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted snapshot. Entries marked flat become empty slots.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let positions = snapshot
            .positions
            .into_iter()
            .map(|(symbol, pos)| (symbol, pos.filter(Position::is_open)))
            .collect();
        Self { positions, last_signal: snapshot.last_signal_index }
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            schema_version: SCHEMA_VERSION,
            positions: self.positions.clone(),
            last_signal_index: self.last_signal.clone(),
        }
    }

    /// Make sure `symbol` has a slot so flat symbols show up in snapshots.
    pub fn track(&mut self, symbol: &str) {
        self.positions.entry(symbol.to_string()).or_insert(None);
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut Position> {
        self.positions.get_mut(symbol).and_then(Option::as_mut)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().flatten()
    }

    pub fn open_count(&self) -> usize {
        self.open_positions().count()
    }

    pub fn last_signal(&self, symbol: &str) -> Option<i64> {
        self.last_signal.get(symbol).copied()
    }

    /// Whether the signal on `candle_id` has already been acted on.
    pub fn is_consumed(&self, symbol: &str, candle_id: i64) -> bool {
        self.last_signal(symbol).is_some_and(|last| last >= candle_id)
    }

    pub fn consume_signal(&mut self, symbol: &str, candle_id: i64) {
        self.last_signal.insert(symbol.to_string(), candle_id);
    }

    /// Record a newly opened position. Refuses a second open position per symbol.
    pub fn open(&mut self, position: Position) -> Result<()> {
        if let Some(existing) = self.get(&position.symbol) {
            return Err(Error::Other(format!(
                "{} already has an open {} position",
                existing.symbol, existing.side
            )));
        }
        self.positions.insert(position.symbol.clone(), Some(position));
        Ok(())
    }

    /// Install a position regardless of what the slot held (venue adoption).
    pub fn replace(&mut self, position: Position) -> Option<Position> {
        self.positions
            .insert(position.symbol.clone(), Some(position))
            .flatten()
    }

    /// Empty the slot for `symbol`, returning the position that was open.
    pub fn close(&mut self, symbol: &str) -> Option<Position> {
        self.positions.get_mut(symbol).and_then(Option::take)
    }
}

// ─── Transitions ──────────────────────────────────────────────────────────────

/// Position opened from a confirmed entry fill.
pub fn open_from_fill(fill: &Fill, levels: &RiskLevels, leverage: u32, candle_id: i64) -> Position {
    let hfp = fill.fill_price;
    Position {
        symbol: fill.symbol.clone(),
        side: fill.side,
        entry_price: fill.fill_price,
        quantity: fill.quantity,
        stop_loss: levels.stop_loss,
        take_profit: levels.take_profit,
        trailing_stop: hfp - fill.side.sign() * levels.trailing_offset,
        trailing_offset: levels.trailing_offset,
        highest_favorable_price: hfp,
        status: PositionStatus::Open,
        opened_at: fill.timestamp,
        order_id: Some(fill.order_id.clone()),
        leverage,
        bars_held: 0,
        last_candle_id: Some(candle_id),
        levels_pending: false,
    }
}

/// Position taken over from the venue. Risk levels are filled in by
/// [`apply_levels`] once ATR is available.
pub fn adopt(venue: &VenuePosition, leverage: u32, now: DateTime<Utc>) -> Position {
    let hfp = venue.mark_price.filter(|p| *p > 0.0).unwrap_or(venue.entry_price);
    Position {
        symbol: venue.symbol.clone(),
        side: venue.side,
        entry_price: venue.entry_price,
        quantity: venue.quantity,
        stop_loss: 0.0,
        take_profit: 0.0,
        trailing_stop: 0.0,
        trailing_offset: 0.0,
        highest_favorable_price: hfp,
        status: PositionStatus::Open,
        opened_at: now,
        order_id: None,
        leverage,
        bars_held: 0,
        last_candle_id: None,
        levels_pending: true,
    }
}

/// Fill in stop loss, take profit and trailing stop for an adopted position.
pub fn apply_levels(pos: &mut Position, levels: &RiskLevels) {
    pos.stop_loss = levels.stop_loss;
    pos.take_profit = levels.take_profit;
    pos.trailing_offset = levels.trailing_offset;
    pos.trailing_stop = pos.highest_favorable_price - pos.side.sign() * levels.trailing_offset;
    pos.levels_pending = false;
}

/// Apply a closed candle to the trailing ratchet.
///
/// Each candle id is applied at most once. Returns `true` if the position
/// changed.
pub fn ratchet(pos: &mut Position, close: f64, candle_id: i64) -> bool {
    if pos.last_candle_id.is_some_and(|last| candle_id <= last) {
        return false;
    }
    pos.last_candle_id = Some(candle_id);
    pos.bars_held += 1;

    match pos.side {
        Side::Long => pos.highest_favorable_price = pos.highest_favorable_price.max(close),
        Side::Short => pos.highest_favorable_price = pos.highest_favorable_price.min(close),
    }
    if pos.levels_pending {
        return true;
    }

    let candidate = pos.highest_favorable_price - pos.side.sign() * pos.trailing_offset;
    pos.trailing_stop = match pos.side {
        Side::Long => pos.trailing_stop.max(candidate),
        Side::Short => pos.trailing_stop.min(candidate),
    };
    true
}

/// Why the position should be closed at `close`, if at all.
pub fn exit_reason(pos: &Position, close: f64, engine_take_profit: bool, max_bars: u32) -> Option<ExitReason> {
    if pos.levels_pending {
        return None;
    }
    let floor = pos.effective_floor();
    let floor_hit = match pos.side {
        Side::Long => close <= floor,
        Side::Short => close >= floor,
    };
    if floor_hit {
        let trailing_binds = match pos.side {
            Side::Long => pos.trailing_stop > pos.stop_loss,
            Side::Short => pos.trailing_stop < pos.stop_loss,
        };
        return Some(if trailing_binds { ExitReason::TrailingStop } else { ExitReason::StopLoss });
    }

    if engine_take_profit {
        let tp_hit = match pos.side {
            Side::Long => close >= pos.take_profit,
            Side::Short => close <= pos.take_profit,
        };
        if tp_hit {
            return Some(ExitReason::TakeProfit);
        }
    }

    if max_bars > 0 && pos.bars_held >= max_bars {
        return Some(ExitReason::TimeExit);
    }
    None
}
