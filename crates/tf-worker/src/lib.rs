//! Task consumers
//!
//! - [`PrimaryProcessor`]: main queue. Processes a task, upserts its status,
//!   acks. Any failure is a `nack(requeue = false)` the broker routes to the DLQ.
//! - [`RetryCoordinator`]: DLQ. Reads the retry counter from the delivery
//!   headers and decides between retry (backoff, re-publish to the main queue),
//!   quarantine (persist, leave the live system) and completion (status upsert,
//!   completion event).
//! - [`ConsumerLoop`]: feeds one delivery at a time from a queue into either.

pub mod backoff;
pub mod completion;
pub mod consumer_loop;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod processor;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use tf_queue::{QueueConsumer, QueuedMessage};

pub use backoff::BackoffPolicy;
pub use completion::CompletionPublisher;
pub use consumer_loop::ConsumerLoop;
pub use coordinator::RetryCoordinator;
pub use error::{Result, WorkerError};
pub use handler::{
    Attempt, FinalAttemptSucceeds, ProcessingError, SimulatedProcessing, TaskHandler,
};
pub use processor::PrimaryProcessor;
pub use retry::{RetryDecision, RetryPolicy};

/// Terminal outcome of one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Main queue: processed, status upserted, acked
    Processed { order_id: i64 },
    /// Main queue: rejected without requeue, bound for the DLQ
    DeadLettered { order_id: Option<i64>, reason: String },
    /// DLQ: unparseable body, acked and discarded
    Dropped { reason: String },
    /// DLQ: re-published to the main queue with the counter set to `next_count`
    Retried { order_id: i64, next_count: u32, backoff: Duration },
    /// DLQ: out of attempts, written to the quarantine store
    Quarantined { order_id: i64, retry_count: u32 },
    /// DLQ: processed on a retry, status upserted and completion announced
    Completed { order_id: i64, retry_count: u32 },
}

/// Handles a single delivery and settles it with the consumer it came from.
///
/// An `Err` means the delivery was left unsettled; [`ConsumerLoop`] then
/// requeues it.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(
        &self,
        message: QueuedMessage,
        consumer: &dyn QueueConsumer,
    ) -> Result<Transition>;
}
