use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tf_common::Task;
use tf_queue::{BrokerGateway, OutboundMessage, QueueSpec};
use tracing::{error, info};

/// Announces reprocessed tasks on the downstream status queue.
///
/// Failures are logged and swallowed: a lost announcement never undoes the
/// status upsert or the acknowledgement that the caller already performed.
pub struct CompletionPublisher {
    broker: Arc<dyn BrokerGateway>,
    queue: String,
    declared: AtomicBool,
}

impl CompletionPublisher {
    pub fn new(broker: Arc<dyn BrokerGateway>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
            declared: AtomicBool::new(false),
        }
    }

    /// Publish `task` persistently. Returns whether the broker accepted it.
    pub async fn publish(&self, task: &Task) -> bool {
        let body = match task.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                error!(
                    order_id = task.order_id,
                    error = %e,
                    "Failed to serialize completion event"
                );
                return false;
            }
        };

        if !self.declared.load(Ordering::SeqCst) {
            if let Err(e) = self.broker.declare(&QueueSpec::durable(&self.queue)).await {
                error!(queue = %self.queue, error = %e, "Failed to declare status queue");
                return false;
            }
            self.declared.store(true, Ordering::SeqCst);
        }

        let outbound = OutboundMessage::persistent(body);
        match self.broker.publish(&self.queue, outbound).await {
            Ok(()) => {
                info!(
                    order_id = task.order_id,
                    queue = %self.queue,
                    "Published completion event"
                );
                true
            }
            Err(e) => {
                error!(
                    order_id = task.order_id,
                    queue = %self.queue,
                    error = %e,
                    "Failed to publish completion event"
                );
                false
            }
        }
    }
}
