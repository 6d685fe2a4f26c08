use serde::{Deserialize, Serialize};
use tracing::debug;

use common::{Error, Result, Side};

/// User-configurable risk parameters (`[risk]` table of the strategy file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// ATR length used for the stop-loss distance.
    pub risk_atr_len: usize,
    /// Stop-loss distance in ATRs.
    pub risk_atr_mult: f64,
    /// ATR length used for the trailing offset.
    pub tsl_atr_len: usize,
    /// Trailing offset in ATRs.
    pub tsl_mult: f64,
    /// Take-profit distance as a multiple of the stop distance (1:rr).
    pub tp_rr: f64,
    /// Share of the balance committed as notional per entry (0.02 = 2%).
    pub position_size_fraction: f64,
    pub leverage: u32,
    pub leverage_min: u32,
    pub leverage_max: u32,
    /// Cap on simultaneously open positions across all symbols.
    pub max_positions: usize,
    /// Smallest notional (quantity × price) the venue accepts.
    pub min_order_value: f64,
    /// No new entries below this balance.
    pub min_balance: f64,
    /// Close locally when the close crosses take profit. Off by default: the
    /// take profit rides on the venue as part of the entry bracket.
    pub engine_take_profit: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_atr_len: 14,
            risk_atr_mult: 2.0,
            tsl_atr_len: 14,
            tsl_mult: 2.0,
            tp_rr: 2.0,
            position_size_fraction: 0.02,
            leverage: 5,
            leverage_min: 1,
            leverage_max: 20,
            max_positions: 999,
            min_order_value: 7.0,
            min_balance: 10.0,
            engine_take_profit: false,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(format!("[risk] {msg}")));
        if self.risk_atr_len == 0 || self.tsl_atr_len == 0 {
            return fail("ATR lengths must be >= 1");
        }
        if !(self.risk_atr_mult > 0.0) || !(self.tsl_mult > 0.0) || !(self.tp_rr > 0.0) {
            return fail("risk_atr_mult, tsl_mult and tp_rr must be positive");
        }
        if !(self.position_size_fraction > 0.0 && self.position_size_fraction <= 1.0) {
            return fail("position_size_fraction must be in (0, 1]");
        }
        if self.leverage_min == 0 || self.leverage_min > self.leverage_max {
            return fail("leverage bounds must satisfy 1 <= leverage_min <= leverage_max");
        }
        if self.max_positions == 0 {
            return fail("max_positions must be >= 1");
        }
        if self.min_order_value < 0.0 || self.min_balance < 0.0 {
            return fail("min_order_value and min_balance must not be negative");
        }
        Ok(())
    }

    /// Configured leverage clamped to `[leverage_min, leverage_max]`.
    pub fn effective_leverage(&self) -> u32 {
        self.leverage.clamp(self.leverage_min, self.leverage_max)
    }
}

/// Price levels fixed at entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskLevels {
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_distance: f64,
    /// A distance, not a price.
    pub trailing_offset: f64,
}

/// Stop loss, take profit and trailing offset for an entry.
///
/// `risk_atr` and `tsl_atr` may come from different ATR lengths.
pub fn compute_levels(
    entry_price: f64,
    side: Side,
    risk_atr: f64,
    tsl_atr: f64,
    config: &RiskConfig,
) -> Result<RiskLevels> {
    if !(entry_price > 0.0) || !entry_price.is_finite() {
        return Err(Error::InvalidRisk(format!("entry price {entry_price} is not positive")));
    }

    let s = side.sign();
    let stop_loss = entry_price - s * (risk_atr * config.risk_atr_mult);
    let risk_distance = (entry_price - stop_loss).abs();
    // Catches zero, negative and NaN ATR alike.
    if !(risk_distance > 0.0) || !risk_distance.is_finite() || !(risk_atr > 0.0) {
        return Err(Error::InvalidRisk(format!(
            "risk distance {risk_distance} from ATR {risk_atr}"
        )));
    }
    let take_profit = entry_price + s * (risk_distance * config.tp_rr);

    let trailing_offset = tsl_atr * config.tsl_mult;
    if !(trailing_offset > 0.0) || !trailing_offset.is_finite() {
        return Err(Error::InvalidRisk(format!(
            "trailing offset {trailing_offset} from ATR {tsl_atr}"
        )));
    }

    Ok(RiskLevels {
        entry_price,
        stop_loss,
        take_profit,
        risk_distance,
        trailing_offset,
    })
}

/// Order size for an entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSizing {
    /// Requested notional before rounding.
    pub notional: f64,
    /// Venue-rounded quantity.
    pub quantity: f64,
    pub leverage: u32,
    /// Margin committed at the effective leverage.
    pub margin: f64,
}

/// Size an entry: `notional = balance × position_size_fraction`,
/// `quantity = round(notional / entry_price)`.
///
/// `round` is supplied by the venue (step size and minimum quantity) and
/// returns 0.0 when the quantity is not tradable.
pub fn size_position<F>(
    balance: f64,
    entry_price: f64,
    config: &RiskConfig,
    round: F,
) -> Result<PositionSizing>
where
    F: Fn(f64) -> f64,
{
    if !(balance > 0.0) || !balance.is_finite() {
        return Err(Error::InvalidRisk(format!("balance {balance} is not positive")));
    }
    if balance < config.min_balance {
        return Err(Error::InvalidRisk(format!(
            "balance {balance:.2} below minimum {:.2}",
            config.min_balance
        )));
    }
    if !(entry_price > 0.0) {
        return Err(Error::InvalidRisk(format!("entry price {entry_price} is not positive")));
    }

    let notional = balance * config.position_size_fraction;
    let raw_quantity = notional / entry_price;
    let quantity = round(raw_quantity);
    if !(quantity > 0.0) {
        return Err(Error::InvalidRisk(format!(
            "quantity {raw_quantity} rounds below the venue minimum"
        )));
    }

    let rounded_notional = quantity * entry_price;
    if rounded_notional < config.min_order_value {
        return Err(Error::InvalidRisk(format!(
            "order value {rounded_notional:.2} below minimum {:.2}",
            config.min_order_value
        )));
    }

    let leverage = config.effective_leverage();
    debug!(notional, raw_quantity, quantity, leverage, "Position sized");

    Ok(PositionSizing {
        notional,
        quantity,
        leverage,
        margin: rounded_notional / leverage as f64,
    })
}
