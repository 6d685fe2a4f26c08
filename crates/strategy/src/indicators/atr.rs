use serde::{Deserialize, Serialize};

use common::{Candle, Error, Result};

/// How true ranges are averaged into ATR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtrSmoothing {
    /// Seed with the mean of the first `period` true ranges, then
    /// `(prev·(p−1) + tr) / p`.
    #[default]
    Wilder,
    /// Rolling mean of the last `period` true ranges.
    Simple,
}

/// True range per candle. Index 0 has no previous close and uses `high − low`.
pub fn true_range(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let hl = c.high - c.low;
            match i.checked_sub(1).map(|p| candles[p].close) {
                Some(prev_close) => hl
                    .max((c.high - prev_close).abs())
                    .max((c.low - prev_close).abs()),
                None => hl,
            }
        })
        .collect()
}

/// ATR per candle; `None` before index `period − 1`.
pub fn atr(candles: &[Candle], period: usize, smoothing: AtrSmoothing) -> Result<Vec<Option<f64>>> {
    if period == 0 {
        return Err(Error::Config("ATR period must be >= 1".into()));
    }
    if candles.len() < period {
        return Err(Error::InsufficientData { needed: period, got: candles.len() });
    }

    let tr = true_range(candles);
    let mut out = vec![None; candles.len()];
    let p = period as f64;

    let seed = tr[..period].iter().sum::<f64>() / p;
    out[period - 1] = Some(seed);

    match smoothing {
        AtrSmoothing::Wilder => {
            let mut prev = seed;
            for i in period..tr.len() {
                prev = (prev * (p - 1.0) + tr[i]) / p;
                out[i] = Some(prev);
            }
        }
        AtrSmoothing::Simple => {
            let mut window_sum = seed * p;
            for i in period..tr.len() {
                window_sum += tr[i] - tr[i - period];
                out[i] = Some(window_sum / p);
            }
        }
    }

    Ok(out)
}

/// Newest defined ATR value.
pub fn latest_atr(candles: &[Candle], period: usize, smoothing: AtrSmoothing) -> Result<f64> {
    atr(candles, period, smoothing)?
        .last()
        .copied()
        .flatten()
        .ok_or(Error::InsufficientData { needed: period, got: candles.len() })
}

/// True when `values[idx]` is strictly above the median of the `window`
/// values before it. Passes when there is not enough history.
pub fn above_rolling_median(values: &[Option<f64>], idx: usize, window: usize) -> bool {
    if window == 0 || idx < window || idx >= values.len() {
        return true;
    }
    let Some(current) = values[idx] else {
        return true;
    };
    let mut history = match values[idx - window..idx].iter().copied().collect::<Option<Vec<f64>>>() {
        Some(v) => v,
        None => return true,
    };
    history.sort_by(|a, b| a.total_cmp(b));
    let mid = history.len() / 2;
    let median = if history.len() % 2 == 0 {
        (history[mid - 1] + history[mid]) / 2.0
    } else {
        history[mid]
    };
    current > median
}
