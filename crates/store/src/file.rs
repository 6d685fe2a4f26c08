use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use common::{ClosedTrade, Error, Result, Snapshot, StateStore};

/// Snapshot in a single JSON file, trade journal as JSON lines beside it.
///
/// Saves go to `<path>.tmp`, are fsynced, then renamed over `<path>`, so a
/// reader only ever sees a complete snapshot.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    journal_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let journal_path = path.with_file_name(format!("{stem}.trades.jsonl"));
        Self { path, journal_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// All journalled trades, oldest first.
    pub async fn read_trades(&self) -> Result<Vec<ClosedTrade>> {
        let text = match fs::read_to_string(&self.journal_path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(persistence(&self.journal_path, "read", e)),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| Error::Persistence(format!("corrupt journal line: {e}")))
            })
            .collect()
    }

    async fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence(parent, "create directory", e))?;
        }
        Ok(())
    }
}

fn persistence(path: &Path, action: &str, e: std::io::Error) -> Error {
    Error::Persistence(format!("{action} {}: {e}", path.display()))
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Snapshot::from_json(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persistence(&self.path, "read", e)),
        }
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.ensure_parent(&self.path).await?;
        let body = snapshot.to_json()?;
        let tmp = self.tmp_path();

        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| persistence(&tmp, "create", e))?;
        file.write_all(body.as_bytes())
            .await
            .map_err(|e| persistence(&tmp, "write", e))?;
        file.sync_all().await.map_err(|e| persistence(&tmp, "fsync", e))?;
        drop(file);

        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| persistence(&self.path, "replace", e))?;
        debug!(path = %self.path.display(), "Snapshot saved");
        Ok(())
    }

    async fn record_trade(&self, trade: &ClosedTrade) -> Result<()> {
        self.ensure_parent(&self.journal_path).await?;
        let mut line = serde_json::to_string(trade)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .await
            .map_err(|e| persistence(&self.journal_path, "open", e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| persistence(&self.journal_path, "append", e))?;
        file.sync_data()
            .await
            .map_err(|e| persistence(&self.journal_path, "fsync", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_sits_beside_snapshot() {
        let store = JsonFileStore::new("data/bot_state.json");
        assert_eq!(store.journal_path(), Path::new("data/bot_state.trades.jsonl"));
        assert_eq!(store.tmp_path(), PathBuf::from("data/bot_state.json.tmp"));
    }
}
