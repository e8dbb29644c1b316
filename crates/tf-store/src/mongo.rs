use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use tracing::{debug, info};

use crate::repository::{Result, StatusRecord, StatusStore, StoreError};

/// Status records in a MongoDB collection, one document per `order_id`
pub struct MongoStatusStore {
    client: Client,
    collection: Collection<Document>,
    identifier: String,
}

impl MongoStatusStore {
    pub fn new(client: Client, db_name: &str, collection_name: &str) -> Self {
        let collection = client.database(db_name).collection(collection_name);
        Self {
            client,
            collection,
            identifier: format!("mongo:{}/{}", db_name, collection_name),
        }
    }

    pub async fn connect(uri: &str, db_name: &str, collection_name: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self::new(client, db_name, collection_name))
    }

    /// Unique index on `order_id` so concurrent upserts cannot create duplicates
    pub async fn ensure_indexes(&self) -> Result<()> {
        let index = IndexModel::builder()
            .keys(doc! { "order_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.collection.create_index(index).await?;
        info!(store = %self.identifier, "Ensured unique index on order_id");
        Ok(())
    }
}

fn upsert_filter(order_id: i64) -> Document {
    doc! { "order_id": order_id }
}

fn upsert_update(record: &StatusRecord) -> Document {
    doc! {
        "$set": {
            "status": record.status.as_str(),
            "retry_count": i64::from(record.retry_count),
        }
    }
}

fn record_from_document(doc: &Document) -> Result<StatusRecord> {
    let order_id = read_int(doc, "order_id")
        .ok_or_else(|| StoreError::Decode("missing order_id".to_string()))?;
    let status = doc
        .get_str("status")
        .map_err(|e| StoreError::Decode(e.to_string()))?
        .to_string();
    let retry_count = read_int(doc, "retry_count").unwrap_or(0);

    Ok(StatusRecord {
        order_id,
        status,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
    })
}

/// Documents written by other clients may store integers as 32 or 64 bit
fn read_int(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key)? {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(f) if f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }
}

#[async_trait]
impl StatusStore for MongoStatusStore {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn upsert(&self, record: &StatusRecord) -> Result<()> {
        let result = self
            .collection
            .update_one(upsert_filter(record.order_id), upsert_update(record))
            .upsert(true)
            .await?;
        debug!(
            order_id = record.order_id,
            matched = result.matched_count,
            modified = result.modified_count,
            inserted = result.upserted_id.is_some(),
            "Status record upserted"
        );
        Ok(())
    }

    async fn get(&self, order_id: i64) -> Result<Option<StatusRecord>> {
        match self.collection.find_one(upsert_filter(order_id)).await? {
            Some(doc) => record_from_document(&doc).map(Some),
            None => Ok(None),
        }
    }

    async fn close(&self) {
        // shutdown() consumes a handle; clones share the same topology
        self.client.clone().shutdown().await;
        info!(store = %self.identifier, "MongoDB connection closed");
    }
}
