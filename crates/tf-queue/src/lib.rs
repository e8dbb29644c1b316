//! Broker gateway
//!
//! Narrow interface over the message broker: queue declaration, polling
//! consumers with explicit ack/nack, and persistent publishing.
//!
//! Backends:
//! - `amqp` (feature `amqp`): RabbitMQ via lapin
//! - `memory`: in-process broker with dead-letter routing, used by tests

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

use std::sync::Arc;

use async_trait::async_trait;
use tf_common::Headers;
use thiserror::Error;

pub use memory::{InMemoryBroker, MessageSnapshot};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Queue not declared: {0}")]
    UnknownQueue(String),

    #[error("Unknown receipt handle: {0}")]
    UnknownReceipt(String),

    #[error("Consumer stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Declaration parameters for a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Queue that receives deliveries rejected with `requeue = false`
    pub dead_letter_to: Option<String>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter_to: None,
        }
    }

    pub fn with_dead_letter(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_to = Some(queue.into());
        self
    }
}

/// A delivery received from a queue, pending ack or nack
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub receipt_handle: String,
    pub redelivered: bool,
    pub queue_identifier: String,
}

impl QueuedMessage {
    /// Body as text for log lines
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A message about to be published
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub persistent: bool,
}

impl OutboundMessage {
    pub fn persistent(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: Headers::new(),
            persistent: true,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
pub trait QueueConsumer: Send + Sync {
    fn identifier(&self) -> &str;

    /// Fetch up to `max_messages` deliveries, waiting a bounded time when the queue is empty
    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>>;

    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Reject a delivery. Without requeue the broker dead-letters it if the queue has a target.
    async fn nack(&self, receipt_handle: &str, requeue: bool) -> Result<()>;

    async fn stop(&self);
}

#[async_trait]
pub trait BrokerGateway: Send + Sync {
    fn identifier(&self) -> &str;

    /// Idempotent queue declaration
    async fn declare(&self, spec: &QueueSpec) -> Result<()>;

    async fn consumer(&self, queue: &str) -> Result<Arc<dyn QueueConsumer>>;

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()>;

    /// Release the broker connection
    async fn close(&self);
}
