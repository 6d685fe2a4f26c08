use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use common::{ClosedTrade, Error, ExitReason, Result, Side, Snapshot, StateStore};

/// Snapshot and trade journal in SQLite.
///
/// The snapshot is one row (`id = 1`) replaced inside a transaction.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and apply migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self::from_pool(pool).await?;
        info!(url, "SQLite state store ready");
        Ok(store)
    }

    /// Wrap an existing pool, applying migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Persistence(format!("migration failed: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Most recent journalled trades, newest first.
    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<ClosedTrade>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, side, entry_price, exit_price, quantity, pnl, reason, opened_at, closed_at
            FROM trades
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ClosedTrade> {
                let reason: String = row.try_get("reason")?;
                let opened_at: String = row.try_get("opened_at")?;
                let closed_at: String = row.try_get("closed_at")?;
                Ok(ClosedTrade {
                    symbol: row.try_get("symbol")?,
                    side: row.try_get::<Side, _>("side")?,
                    entry_price: row.try_get("entry_price")?,
                    exit_price: row.try_get("exit_price")?,
                    quantity: row.try_get("quantity")?,
                    pnl: row.try_get("pnl")?,
                    reason: parse_reason(&reason)?,
                    opened_at: parse_time(&opened_at)?,
                    closed_at: parse_time(&closed_at)?,
                })
            })
            .collect()
    }
}

fn reason_label(reason: ExitReason) -> Result<String> {
    match serde_json::to_value(reason)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(Error::Persistence(format!("unexpected exit reason encoding {other}"))),
    }
}

fn parse_reason(label: &str) -> Result<ExitReason> {
    serde_json::from_value(serde_json::Value::String(label.to_string()))
        .map_err(|e| Error::Persistence(format!("unknown exit reason '{label}': {e}")))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Persistence(format!("bad timestamp '{raw}': {e}")))
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        let row = sqlx::query("SELECT body FROM snapshot WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let body: String = row.try_get("body")?;
                Snapshot::from_json(&body).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let body = snapshot.to_json()?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO snapshot (id, schema_version, body, updated_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                schema_version = excluded.schema_version,
                body           = excluded.body,
                updated_at     = excluded.updated_at
            "#,
        )
        .bind(snapshot.schema_version as i64)
        .bind(&body)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("Snapshot saved");
        Ok(())
    }

    async fn record_trade(&self, trade: &ClosedTrade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (symbol, side, entry_price, exit_price, quantity, pnl, reason, opened_at, closed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&trade.symbol)
        .bind(trade.side)
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.quantity)
        .bind(trade.pnl)
        .bind(reason_label(trade.reason)?)
        .bind(trade.opened_at.to_rfc3339())
        .bind(trade.closed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
