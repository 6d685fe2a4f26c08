pub mod config;
pub mod error;
pub mod exchange;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use exchange::{ExecutionVenue, MarketData};
pub use store::{Snapshot, StateStore, SCHEMA_VERSION};
pub use types::*;
