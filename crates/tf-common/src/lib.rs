use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod telemetry;

// ============================================================================
// Task Message
// ============================================================================

/// Status stamped onto a task once it has been processed successfully
pub const STATUS_PROCESSED: &str = "processed";

/// Header carrying the number of DLQ deliveries a task has already consumed
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// The unit of work flowing through the main queue and the DLQ.
///
/// `order_id` identifies the business entity and is shared by every redelivery
/// of the same logical task. Unknown business fields are kept in `extra` so a
/// parsed task serializes back with the fields it arrived with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub order_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    pub fn new(order_id: i64) -> Self {
        Self {
            order_id,
            user_id: None,
            amount: None,
            status: None,
            retry_count: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Parse a task from a raw delivery body
    pub fn parse(body: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TaskflowError::Serialization(e.to_string()))
    }

    /// Stamp the terminal success fields
    pub fn completed(mut self, attempt: u32) -> Self {
        self.status = Some(STATUS_PROCESSED.to_string());
        self.retry_count = Some(attempt);
        self
    }

    /// Stamp the retry count carried into the quarantine record
    pub fn quarantined(mut self, attempt: u32) -> Self {
        self.retry_count = Some(attempt);
        self
    }
}

// ============================================================================
// Transport Headers
// ============================================================================

/// A broker-neutral header value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// Read the retry counter from delivery headers.
///
/// Absent or unreadable values mean the task has not been through the DLQ yet.
pub fn retry_count_from(headers: &Headers) -> u32 {
    match headers.get(RETRY_COUNT_HEADER) {
        Some(HeaderValue::Int(n)) => {
            u32::try_from(*n).unwrap_or(if *n > 0 { u32::MAX } else { 0 })
        }
        Some(HeaderValue::Float(f)) if f.is_finite() && *f >= 0.0 => *f as u32,
        Some(HeaderValue::Text(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Copy `headers` with the retry counter set to `count`
pub fn with_retry_count(headers: &Headers, count: u32) -> Headers {
    let mut headers = headers.clone();
    headers.insert(RETRY_COUNT_HEADER.to_string(), HeaderValue::Int(i64::from(count)));
    headers
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TaskflowError {
    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, TaskflowError>;
