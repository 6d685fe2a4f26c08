use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Not enough candles to evaluate. Skip the symbol this cycle.
    #[error("insufficient data: need {needed} candles, got {got}")]
    InsufficientData { needed: usize, got: usize },

    /// Degenerate risk geometry or sizing. No order is placed.
    #[error("invalid risk: {0}")]
    InvalidRisk(String),

    #[error("venue error: {0}")]
    Venue(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("market data error for {symbol}: {message}")]
    MarketData {
        symbol: String,
        transient: bool,
        message: String,
    },

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Durable state could not be written or read. Fatal for the cycle.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a read-only call that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::Http(_) => true,
            Error::MarketData { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Whether this error means durable state may diverge from memory.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Error::Persistence(_) | Error::Database(_) | Error::Io(_) | Error::Json(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
