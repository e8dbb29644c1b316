use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::repository::{
    QuarantineEntry, QuarantineRecord, QuarantineStore, Result, StatusRecord, StatusStore,
    StoreError,
};

/// Status store backed by a map keyed on `order_id`
#[derive(Default)]
pub struct InMemoryStatusStore {
    records: Mutex<HashMap<i64, StatusRecord>>,
    upserts: AtomicUsize,
    failing: AtomicBool,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of upsert calls that reached the store, successful or not
    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Simulate the store being unreachable
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    fn identifier(&self) -> &str {
        "memory-status"
    }

    async fn upsert(&self, record: &StatusRecord) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("status store offline".to_string()));
        }
        self.records.lock().insert(record.order_id, record.clone());
        Ok(())
    }

    async fn get(&self, order_id: i64) -> Result<Option<StatusRecord>> {
        Ok(self.records.lock().get(&order_id).cloned())
    }

    async fn close(&self) {}
}

/// Append-only quarantine rows held in memory
#[derive(Default)]
pub struct InMemoryQuarantineStore {
    rows: Mutex<Vec<QuarantineRecord>>,
    failing: AtomicBool,
}

impl InMemoryQuarantineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<QuarantineRecord> {
        self.rows.lock().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl QuarantineStore for InMemoryQuarantineStore {
    fn identifier(&self) -> &str {
        "memory-quarantine"
    }

    async fn append(&self, entry: &QuarantineEntry) -> Result<i64> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("quarantine store offline".to_string()));
        }
        let mut rows = self.rows.lock();
        let id = rows.len() as i64 + 1;
        rows.push(QuarantineRecord {
            id,
            entry: entry.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn recent(&self, limit: u32) -> Result<Vec<QuarantineRecord>> {
        let rows = self.rows.lock();
        Ok(rows.iter().rev().take(limit as usize).cloned().collect())
    }

    async fn count_for(&self, order_id: i64) -> Result<u64> {
        let rows = self.rows.lock();
        Ok(rows.iter().filter(|r| r.entry.order_id == order_id).count() as u64)
    }

    async fn close(&self) {}
}
