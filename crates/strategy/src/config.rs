use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use common::{Error, Result};
use risk::RiskConfig;

use crate::indicators::AtrSmoothing;

/// Strategy config file (TOML). Every key is optional.
///
/// Example `config/strategy.toml`:
/// ```toml
/// [supertrend]
/// atr_period = 10
/// factor = 3.0
/// smoothing = "wilder"
///
/// [risk]
/// risk_atr_mult = 2.0
/// tp_rr = 2.0
/// position_size_fraction = 0.02
/// leverage = 5
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StrategyFileConfig {
    pub supertrend: SupertrendConfig,
    pub risk: RiskConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SupertrendConfig {
    pub atr_period: usize,
    pub factor: f64,
    pub smoothing: AtrSmoothing,
    /// Only take entries while ATR is above its rolling median.
    pub volatility_filter_enabled: bool,
    pub volatility_median_window: usize,
    /// Close after this many closed candles in the trade. 0 disables.
    pub max_bars_in_trade: u32,
}

impl Default for SupertrendConfig {
    fn default() -> Self {
        Self {
            atr_period: 10,
            factor: 3.0,
            smoothing: AtrSmoothing::Wilder,
            volatility_filter_enabled: false,
            volatility_median_window: 20,
            max_bars_in_trade: 0,
        }
    }
}

impl StrategyFileConfig {
    /// Load and validate the file at `path`. A missing file means defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No strategy config file, using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read strategy config at '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("Strategy config at '{}': {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let st = &self.supertrend;
        if st.atr_period == 0 {
            return Err(Error::Config("[supertrend] atr_period must be >= 1".into()));
        }
        if !(st.factor > 0.0) || !st.factor.is_finite() {
            return Err(Error::Config("[supertrend] factor must be positive".into()));
        }
        if st.volatility_filter_enabled && st.volatility_median_window == 0 {
            return Err(Error::Config(
                "[supertrend] volatility_median_window must be >= 1 when the filter is on".into(),
            ));
        }
        self.risk.validate()
    }

    /// Closed candles needed before a signal can be evaluated.
    pub fn required_history(&self) -> usize {
        (self.supertrend.atr_period + 2)
            .max(self.risk.risk_atr_len)
            .max(self.risk.tsl_atr_len)
    }
}
