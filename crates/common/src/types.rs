use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// One OHLCV candle. `timestamp` is the candle open time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Stable integer id of the candle: its open time in epoch milliseconds.
    /// Survives the fetch window sliding forward, unlike a positional index.
    pub fn id(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    pub fn hl2(&self) -> f64 {
        (self.high + self.low) / 2.0
    }
}

/// Candle interval, e.g. `15m`, `1h`, `1d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeframe {
    minutes: u32,
}

impl Timeframe {
    pub fn from_minutes(minutes: u32) -> Self {
        Self { minutes }
    }

    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes as i64)
    }

    /// Whether a candle opened at `open_time` has closed by `now`.
    pub fn is_closed(&self, open_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        open_time + self.duration() <= now
    }
}

impl FromStr for Timeframe {
    type Err = Error;

    /// Accepts `5m`, `1h`, `4h`, `1d`, `1w` and the bare forms `15` (minutes) and `D`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || Error::Config(format!("invalid timeframe '{s}'"));

        match s {
            "D" | "d" => return Ok(Self::from_minutes(24 * 60)),
            "W" | "w" => return Ok(Self::from_minutes(7 * 24 * 60)),
            _ => {}
        }

        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => s.split_at(idx),
            None => (s, "m"),
        };
        let n: u32 = digits.parse().map_err(|_| invalid())?;
        if n == 0 {
            return Err(invalid());
        }
        let minutes = match unit {
            "m" => n,
            "h" | "H" => n * 60,
            "d" | "D" => n * 24 * 60,
            "w" | "W" => n * 7 * 24 * 60,
            _ => return Err(invalid()),
        };
        Ok(Self::from_minutes(minutes))
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.minutes;
        if m % (7 * 24 * 60) == 0 {
            write!(f, "{}w", m / (7 * 24 * 60))
        } else if m % (24 * 60) == 0 {
            write!(f, "{}d", m / (24 * 60))
        } else if m % 60 == 0 {
            write!(f, "{}h", m / 60)
        } else {
            write!(f, "{m}m")
        }
    }
}

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short. Used in all price-geometry formulas.
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Output of the signal evaluator for the newest closed candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    EnterLong,
    EnterShort,
    NoSignal,
}

impl Signal {
    pub fn side(&self) -> Option<Side> {
        match self {
            Signal::EnterLong => Some(Side::Long),
            Signal::EnterShort => Some(Side::Short),
            Signal::NoSignal => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Flat,
    Open,
}

/// A position tracked by the position state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    /// Fixed at entry.
    pub stop_loss: f64,
    /// Fixed at entry.
    pub take_profit: f64,
    /// Ratchets in the profit-protecting direction only.
    pub trailing_stop: f64,
    /// Distance kept between `highest_favorable_price` and the trailing candidate.
    pub trailing_offset: f64,
    /// Highest close since entry for longs, lowest for shorts.
    pub highest_favorable_price: f64,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// Closed candles applied since entry.
    #[serde(default)]
    pub bars_held: u32,
    /// Newest candle id already applied to the ratchet.
    #[serde(default)]
    pub last_candle_id: Option<i64>,
    /// Set for positions adopted from the venue whose risk levels are not known yet.
    #[serde(default)]
    pub levels_pending: bool,
}

fn default_leverage() -> u32 {
    1
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// The more protective of `stop_loss` and `trailing_stop`.
    pub fn effective_floor(&self) -> f64 {
        match self.side {
            Side::Long => self.stop_loss.max(self.trailing_stop),
            Side::Short => self.stop_loss.min(self.trailing_stop),
        }
    }

    /// Profit or loss in quote currency if closed at `exit_price`.
    pub fn pnl_at(&self, exit_price: f64) -> f64 {
        (exit_price - self.entry_price) * self.side.sign() * self.quantity
    }
}

/// An entry order with its protective bracket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub leverage: u32,
}

impl OrderRequest {
    pub fn market(
        symbol: impl Into<String>,
        side: Side,
        quantity: f64,
        stop_loss: f64,
        take_profit: f64,
        leverage: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            quantity,
            stop_loss,
            take_profit,
            leverage,
        }
    }
}

/// Confirmation of a filled entry order returned by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub fill_price: f64,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
}

/// Confirmation of a closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseFill {
    pub symbol: String,
    pub fill_price: f64,
    pub timestamp: DateTime<Utc>,
}

/// A position as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    /// Latest mark price, when the venue reports one.
    pub mark_price: Option<f64>,
}

/// Quantity constraints of a tradable instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub min_quantity: f64,
    pub quantity_step: f64,
}

impl Default for InstrumentSpec {
    fn default() -> Self {
        Self {
            min_quantity: 0.001,
            quantity_step: 0.001,
        }
    }
}

impl InstrumentSpec {
    /// Round `raw` down to the step size. Returns 0.0 below the minimum quantity.
    pub fn round_quantity(&self, raw: f64) -> f64 {
        if !raw.is_finite() || raw <= 0.0 {
            return 0.0;
        }
        let quantity = if self.quantity_step > 0.0 {
            // Epsilon guards against 0.3 / 0.1 = 2.9999999999999996.
            let steps = (raw / self.quantity_step + 1e-9).floor();
            round_to_step_precision(steps * self.quantity_step, self.quantity_step)
        } else {
            raw
        };
        if quantity < self.min_quantity {
            0.0
        } else {
            quantity
        }
    }
}

fn round_to_step_precision(value: f64, step: f64) -> f64 {
    let decimals = (-step.log10()).ceil().max(0.0) as i32;
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    OppositeSignal,
    TimeExit,
    ClosedOnVenue,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop loss"),
            ExitReason::TrailingStop => write!(f, "trailing stop"),
            ExitReason::TakeProfit => write!(f, "take profit"),
            ExitReason::OppositeSignal => write!(f, "opposite signal"),
            ExitReason::TimeExit => write!(f, "time exit"),
            ExitReason::ClosedOnVenue => write!(f, "closed on venue"),
        }
    }
}

/// A finished round trip, appended to the trade journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl: f64,
    pub reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    pub fn from_position(
        position: &Position,
        exit_price: f64,
        reason: ExitReason,
        closed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            pnl: position.pnl_at(exit_price),
            reason,
            opened_at: position.opened_at,
            closed_at,
        }
    }
}

/// Whether the bot is running against the real exchange or simulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    Paper,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
        }
    }
}

/// Current state of the polling engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Stopped,
    Running,
    Paused,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
        }
    }
}

/// Commands sent to the engine via the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    /// Skip cycles until resumed. The cycle in flight always completes.
    Pause,
    Resume,
    /// Run one cycle immediately instead of waiting for the next tick.
    RunNow,
    /// Finish the current cycle and exit the loop.
    Stop,
}

/// Notable state changes, forwarded to operator alerts.
#[derive(Debug, Clone, PartialEq)]
pub enum TradeEvent {
    PositionOpened {
        symbol: String,
        side: Side,
        price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit: f64,
    },
    PositionClosed {
        symbol: String,
        side: Side,
        price: f64,
        pnl: f64,
        reason: ExitReason,
    },
    PositionAdopted {
        symbol: String,
        side: Side,
        quantity: f64,
    },
    OrderFailed {
        symbol: String,
        error: String,
    },
    /// An adopted position whose stop levels cannot be computed yet, so only
    /// the venue-side bracket (if any) protects it.
    Unprotected {
        symbol: String,
        error: String,
    },
    CycleFailed {
        error: String,
    },
}
