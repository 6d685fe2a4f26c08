pub mod config;
pub mod indicators;
pub mod signal;

pub use config::{StrategyFileConfig, SupertrendConfig};
pub use indicators::{AtrSmoothing, SupertrendState, Trend};

use chrono::{DateTime, Utc};
use tracing::debug;

use common::{Candle, Error, Result, Signal, Timeframe};
use risk::RiskConfig;

/// Everything the position state machine needs from one symbol's candles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Analysis {
    pub signal: Signal,
    /// Id of the newest closed candle.
    pub candle_id: i64,
    pub candle_time: DateTime<Utc>,
    pub close: f64,
    /// ATR over `risk_atr_len`, for the stop distance.
    pub risk_atr: f64,
    /// ATR over `tsl_atr_len`, for the trailing offset.
    pub tsl_atr: f64,
    pub direction: Trend,
    /// The flip failed the volatility filter. It still closes an opposite
    /// position but must not open a new one.
    pub filtered: bool,
}

/// Supertrend flip strategy: closed candles in, [`Analysis`] out. Stateless.
#[derive(Debug, Clone)]
pub struct SupertrendStrategy {
    config: StrategyFileConfig,
}

impl SupertrendStrategy {
    pub fn new(config: StrategyFileConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StrategyFileConfig {
        &self.config
    }

    pub fn supertrend_config(&self) -> &SupertrendConfig {
        &self.config.supertrend
    }

    pub fn risk_config(&self) -> &RiskConfig {
        &self.config.risk
    }

    /// Analyse `candles` (oldest first). A still-forming newest candle is ignored.
    pub fn analyze(&self, candles: &[Candle], timeframe: Timeframe, now: DateTime<Utc>) -> Result<Analysis> {
        let closed = signal::closed_only(candles, timeframe, now);
        let needed = self.config.required_history();
        if closed.len() < needed {
            return Err(Error::InsufficientData { needed, got: closed.len() });
        }
        let st = &self.config.supertrend;
        let risk = &self.config.risk;

        let states = indicators::supertrend(closed, st.atr_period, st.factor, st.smoothing)?;
        let sig = signal::evaluate(&states)?;

        let mut filtered = false;
        if st.volatility_filter_enabled && sig != Signal::NoSignal {
            let series = indicators::atr(closed, st.atr_period, st.smoothing)?;
            if !indicators::above_rolling_median(&series, series.len() - 1, st.volatility_median_window) {
                debug!(?sig, "Flip below median volatility, entry will be skipped");
                filtered = true;
            }
        }

        let last = closed[closed.len() - 1];
        let direction = states
            .last()
            .copied()
            .flatten()
            .map(|s| s.direction)
            .ok_or(Error::InsufficientData { needed, got: closed.len() })?;

        Ok(Analysis {
            signal: sig,
            candle_id: last.id(),
            candle_time: last.timestamp,
            close: last.close,
            risk_atr: indicators::latest_atr(closed, risk.risk_atr_len, st.smoothing)?,
            tsl_atr: indicators::latest_atr(closed, risk.tsl_atr_len, st.smoothing)?,
            direction,
            filtered,
        })
    }
}
