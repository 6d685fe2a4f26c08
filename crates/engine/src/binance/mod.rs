pub mod rest;

pub use rest::{BinanceClient, SymbolFilters};
