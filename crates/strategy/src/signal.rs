use chrono::{DateTime, Utc};

use common::{Candle, Error, Result, Signal, Timeframe};

use crate::indicators::{SupertrendState, Trend};

/// Drop the newest candle when it is still forming at `now`.
///
/// Venues return the in-progress candle last; everything before it is closed.
pub fn closed_only(candles: &[Candle], timeframe: Timeframe, now: DateTime<Utc>) -> &[Candle] {
    match candles.last() {
        Some(last) if !timeframe.is_closed(last.timestamp, now) => &candles[..candles.len() - 1],
        _ => candles,
    }
}

/// Flip between the last two Supertrend states.
///
/// `EnterLong` on `Down → Up`, `EnterShort` on `Up → Down`, otherwise
/// `NoSignal`. Either of the two states missing is `InsufficientData`.
pub fn evaluate(states: &[Option<SupertrendState>]) -> Result<Signal> {
    let n = states.len();
    let (prev, curr) = match (n.checked_sub(2).and_then(|i| states[i]), states.last().copied().flatten()) {
        (Some(p), Some(c)) => (p, c),
        (p, c) => {
            return Err(Error::InsufficientData {
                needed: 2,
                got: usize::from(p.is_some()) + usize::from(c.is_some()),
            })
        }
    };

    Ok(match (prev.direction, curr.direction) {
        (Trend::Down, Trend::Up) => Signal::EnterLong,
        (Trend::Up, Trend::Down) => Signal::EnterShort,
        _ => Signal::NoSignal,
    })
}
