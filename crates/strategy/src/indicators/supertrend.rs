use serde::{Deserialize, Serialize};

use common::{Candle, Error, Result};

use super::atr::{atr, AtrSmoothing};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupertrendState {
    pub upper_band: f64,
    pub lower_band: f64,
    /// Lower band while trending up, upper band while trending down.
    pub trend_line: f64,
    pub direction: Trend,
}

/// Supertrend over `candles` (oldest first).
///
/// Returns one entry per candle. Indices `0 ..= period − 1` are `None`; index
/// `period − 1` only seeds the bands and direction. Direction changes need a
/// strict cross of the final band, so equality never flips.
pub fn supertrend(
    candles: &[Candle],
    period: usize,
    factor: f64,
    smoothing: AtrSmoothing,
) -> Result<Vec<Option<SupertrendState>>> {
    if !(factor > 0.0) || !factor.is_finite() {
        return Err(Error::Config(format!("supertrend factor must be positive, got {factor}")));
    }
    let atr_values = atr(candles, period, smoothing)?;

    let mut out = vec![None; candles.len()];

    let seed_idx = period - 1;
    let Some(seed_atr) = atr_values[seed_idx] else {
        return Ok(out);
    };
    let seed = &candles[seed_idx];
    let mut upper = seed.hl2() + factor * seed_atr;
    let mut lower = seed.hl2() - factor * seed_atr;
    let mut direction = if seed.close >= seed.hl2() { Trend::Up } else { Trend::Down };

    for i in period..candles.len() {
        let Some(a) = atr_values[i] else { continue };
        let c = &candles[i];
        let prev_close = candles[i - 1].close;

        let basic_upper = c.hl2() + factor * a;
        let basic_lower = c.hl2() - factor * a;

        upper = if basic_upper < upper || prev_close > upper { basic_upper } else { upper };
        lower = if basic_lower > lower || prev_close < lower { basic_lower } else { lower };

        direction = match direction {
            Trend::Down if c.close > upper => Trend::Up,
            Trend::Up if c.close < lower => Trend::Down,
            d => d,
        };

        let trend_line = match direction {
            Trend::Up => lower,
            Trend::Down => upper,
        };
        out[i] = Some(SupertrendState { upper_band: upper, lower_band: lower, trend_line, direction });
    }

    Ok(out)
}
