use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tf_common::{Task, STATUS_PROCESSED};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(feature = "mongo")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Failed to decode record: {0}")]
    Decode(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Processing status of one business entity, keyed by `order_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub order_id: i64,
    pub status: String,
    pub retry_count: u32,
}

impl StatusRecord {
    pub fn processed(order_id: i64, retry_count: u32) -> Self {
        Self {
            order_id,
            status: STATUS_PROCESSED.to_string(),
            retry_count,
        }
    }

    /// Record for a task that just finished processing
    pub fn from_task(task: &Task) -> Self {
        Self::processed(task.order_id, task.retry_count.unwrap_or(0))
    }
}

/// Fields written for a quarantined task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub order_id: i64,
    pub user_id: Option<i64>,
    pub amount: Option<f64>,
    pub status: Option<String>,
    pub retry_count: u32,
}

impl QuarantineEntry {
    pub fn from_task(task: &Task) -> Self {
        Self {
            order_id: task.order_id,
            user_id: task.user_id,
            amount: task.amount,
            status: task.status.clone(),
            retry_count: task.retry_count.unwrap_or(0),
        }
    }
}

/// A stored quarantine row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub id: i64,
    #[serde(flatten)]
    pub entry: QuarantineEntry,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    fn identifier(&self) -> &str;

    /// Insert the record, or overwrite `status` and `retry_count` of the existing one
    async fn upsert(&self, record: &StatusRecord) -> Result<()>;

    async fn get(&self, order_id: i64) -> Result<Option<StatusRecord>>;

    async fn close(&self);
}

#[async_trait]
pub trait QuarantineStore: Send + Sync {
    fn identifier(&self) -> &str;

    /// Append a row and return its id. Never deduplicates.
    async fn append(&self, entry: &QuarantineEntry) -> Result<i64>;

    /// Most recent rows first
    async fn recent(&self, limit: u32) -> Result<Vec<QuarantineRecord>>;

    async fn count_for(&self, order_id: i64) -> Result<u64>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_record_from_task() {
        let task = Task::new(42).completed(3);
        assert_eq!(StatusRecord::from_task(&task), StatusRecord::processed(42, 3));

        let fresh = Task::new(7);
        assert_eq!(StatusRecord::from_task(&fresh).retry_count, 0);
    }

    #[test]
    fn test_quarantine_entry_from_task() {
        let mut task = Task::new(42);
        task.user_id = Some(9);
        task.amount = Some(12.5);
        let entry = QuarantineEntry::from_task(&task.quarantined(3));

        assert_eq!(entry.order_id, 42);
        assert_eq!(entry.user_id, Some(9));
        assert_eq!(entry.amount, Some(12.5));
        assert_eq!(entry.status, None);
        assert_eq!(entry.retry_count, 3);
    }
}
