pub mod calculator;

pub use calculator::{compute_levels, size_position, PositionSizing, RiskConfig, RiskLevels};
