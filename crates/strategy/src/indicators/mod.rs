pub mod atr;
pub mod supertrend;

pub use atr::{above_rolling_median, atr, latest_atr, true_range, AtrSmoothing};
pub use supertrend::{supertrend, SupertrendState, Trend};
