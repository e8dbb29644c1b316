use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::repository::{QuarantineEntry, QuarantineRecord, QuarantineStore, Result, StoreError};

/// Quarantined tasks in the `failed_messages` table
pub struct SqliteQuarantineStore {
    pool: SqlitePool,
    identifier: String,
}

impl SqliteQuarantineStore {
    pub fn new(pool: SqlitePool, identifier: impl Into<String>) -> Self {
        Self {
            pool,
            identifier: identifier.into(),
        }
    }

    /// Open (creating if missing) the database at `url`
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // SQLite serializes writers; one connection also keeps `:memory:` databases coherent
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool, url))
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failed_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id INTEGER,
                user_id INTEGER,
                amount REAL,
                status TEXT,
                retry_count INTEGER,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_failed_messages_order ON failed_messages(order_id)",
        )
        .execute(&self.pool)
        .await?;
        info!(store = %self.identifier, "Quarantine schema ready");
        Ok(())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<QuarantineRecord> {
    let order_id: Option<i64> = row.try_get("order_id")?;
    let order_id =
        order_id.ok_or_else(|| StoreError::Decode("row without order_id".to_string()))?;
    let retry_count: Option<i64> = row.try_get("retry_count")?;
    let created_at: NaiveDateTime = row.try_get("created_at")?;

    Ok(QuarantineRecord {
        id: row.try_get("id")?,
        entry: QuarantineEntry {
            order_id,
            user_id: row.try_get("user_id")?,
            amount: row.try_get("amount")?,
            status: row.try_get("status")?,
            retry_count: u32::try_from(retry_count.unwrap_or(0)).unwrap_or(0),
        },
        // CURRENT_TIMESTAMP is UTC
        created_at: created_at.and_utc(),
    })
}

#[async_trait]
impl QuarantineStore for SqliteQuarantineStore {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn append(&self, entry: &QuarantineEntry) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO failed_messages (order_id, user_id, amount, status, retry_count)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.order_id)
        .bind(entry.user_id)
        .bind(entry.amount)
        .bind(entry.status.as_deref())
        .bind(i64::from(entry.retry_count))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<QuarantineRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, user_id, amount, status, retry_count, created_at
            FROM failed_messages
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn count_for(&self, order_id: i64) -> Result<u64> {
        let count: i64 =
            sqlx::query("SELECT COUNT(*) FROM failed_messages WHERE order_id = ?")
                .bind(order_id)
                .fetch_one(&self.pool)
                .await?
                .try_get(0)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn close(&self) {
        self.pool.close().await;
        info!(store = %self.identifier, "Quarantine database closed");
    }
}
