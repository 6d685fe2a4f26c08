pub mod binance;
pub mod cycle;
pub mod executor;
pub mod lifecycle;
pub mod position;

pub use binance::BinanceClient;
pub use cycle::{CycleReport, ReconcileReport, StepOutcome, Trader, TraderSettings};
pub use executor::{CallPolicy, VenueExecutor};
pub use lifecycle::{Engine, EngineHandle};
pub use position::PositionBook;
