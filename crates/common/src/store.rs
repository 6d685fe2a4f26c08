use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ClosedTrade, Error, Position, Result};

/// Current on-disk snapshot layout.
pub const SCHEMA_VERSION: u32 = 1;

/// Durable copy of the position book.
///
/// `positions` maps a symbol to its open position, or `None` when flat.
/// `last_signal_index` holds the id of the last candle whose flip was consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub schema_version: u32,
    #[serde(default)]
    pub positions: BTreeMap<String, Option<Position>>,
    #[serde(default)]
    pub last_signal_index: BTreeMap<String, i64>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            positions: BTreeMap::new(),
            last_signal_index: BTreeMap::new(),
        }
    }
}

impl Snapshot {
    /// Parse a snapshot, refusing layouts newer than this build understands.
    pub fn from_json(text: &str) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_str(text)
            .map_err(|e| Error::Persistence(format!("corrupt snapshot: {e}")))?;
        if snapshot.schema_version > SCHEMA_VERSION {
            return Err(Error::Persistence(format!(
                "snapshot schema version {} is newer than supported {}",
                snapshot.schema_version, SCHEMA_VERSION
            )));
        }
        Ok(snapshot)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Persistence(e.to_string()))
    }
}

/// Durable storage for the position book.
///
/// `save` must be atomic: after a crash the store holds either the previous
/// snapshot or the new one, never a mix.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// The last fully written snapshot, or `None` on first start.
    async fn load(&self) -> Result<Option<Snapshot>>;

    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Append a finished round trip to the trade journal.
    async fn record_trade(&self, trade: &ClosedTrade) -> Result<()>;
}
