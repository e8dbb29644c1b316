use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tf_common::Task;
use tf_queue::{QueueConsumer, QueuedMessage};
use tf_store::{StatusRecord, StatusStore};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::handler::{Attempt, TaskHandler};
use crate::{DeliveryHandler, Transition};

/// Main-queue consumer logic.
///
/// The ack always follows the upsert attempt. A crash in between redelivers
/// the task and the upsert runs again, which the store keys on `order_id`.
pub struct PrimaryProcessor {
    handler: Arc<dyn TaskHandler>,
    status_store: Arc<dyn StatusStore>,
    max_retries: u32,
}

impl PrimaryProcessor {
    pub fn new(
        handler: Arc<dyn TaskHandler>,
        status_store: Arc<dyn StatusStore>,
        max_retries: u32,
    ) -> Self {
        Self {
            handler,
            status_store,
            max_retries,
        }
    }

    async fn dead_letter(
        &self,
        message: &QueuedMessage,
        consumer: &dyn QueueConsumer,
        order_id: Option<i64>,
        reason: String,
    ) -> Result<Transition> {
        consumer.nack(&message.receipt_handle, false).await?;
        counter!("tf_tasks_dead_lettered_total", "queue" => message.queue_identifier.clone())
            .increment(1);
        Ok(Transition::DeadLettered { order_id, reason })
    }
}

#[async_trait]
impl DeliveryHandler for PrimaryProcessor {
    async fn handle(
        &self,
        message: QueuedMessage,
        consumer: &dyn QueueConsumer,
    ) -> Result<Transition> {
        let task = match Task::parse(&message.body) {
            Ok(task) => task,
            Err(e) => {
                error!(body = %message.body_lossy(), error = %e, "Malformed task, dead-lettering");
                return self.dead_letter(&message, consumer, None, e.to_string()).await;
            }
        };

        info!(order_id = task.order_id, queue = %message.queue_identifier, "Processing task");

        let attempt = Attempt::first(self.max_retries);
        if let Err(e) = self.handler.handle(&task, &message.body, attempt).await {
            error!(order_id = task.order_id, error = %e, "Processing failed, dead-lettering");
            return self
                .dead_letter(&message, consumer, Some(task.order_id), e.to_string())
                .await;
        }

        if let Err(e) = self.status_store.upsert(&StatusRecord::from_task(&task)).await {
            warn!(
                order_id = task.order_id,
                store = %self.status_store.identifier(),
                error = %e,
                "Status upsert failed"
            );
        }

        consumer.ack(&message.receipt_handle).await?;
        counter!("tf_tasks_processed_total", "queue" => message.queue_identifier.clone())
            .increment(1);
        info!(order_id = task.order_id, "Task processed");
        Ok(Transition::Processed { order_id: task.order_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tf_queue::{BrokerGateway, InMemoryBroker, OutboundMessage, QueueSpec};
    use tf_store::InMemoryStatusStore;

    use crate::handler::SimulatedProcessing;

    struct Fixture {
        broker: InMemoryBroker,
        consumer: Arc<dyn QueueConsumer>,
        store: Arc<InMemoryStatusStore>,
        processor: PrimaryProcessor,
    }

    async fn fixture() -> Fixture {
        let broker = InMemoryBroker::with_poll_wait(Duration::from_millis(5));
        broker.declare(&QueueSpec::durable("task_queue_dlq")).await.unwrap();
        broker
            .declare(&QueueSpec::durable("task_queue").with_dead_letter("task_queue_dlq"))
            .await
            .unwrap();
        let consumer = broker.consumer("task_queue").await.unwrap();
        let store = Arc::new(InMemoryStatusStore::new());
        let processor = PrimaryProcessor::new(
            Arc::new(SimulatedProcessing::new(Duration::ZERO, "fail")),
            store.clone(),
            5,
        );
        Fixture { broker, consumer, store, processor }
    }

    async fn deliver(fixture: &Fixture, body: &[u8]) -> Transition {
        fixture
            .broker
            .publish("task_queue", OutboundMessage::persistent(body.to_vec()))
            .await
            .unwrap();
        let message = fixture.consumer.poll(1).await.unwrap().remove(0);
        fixture.processor.handle(message, fixture.consumer.as_ref()).await.unwrap()
    }

    #[tokio::test]
    async fn test_success_upserts_then_acks() {
        let fixture = fixture().await;
        let transition = deliver(&fixture, br#"{"order_id": 42, "user_id": 1}"#).await;

        assert_eq!(transition, Transition::Processed { order_id: 42 });
        assert_eq!(fixture.store.get(42).await.unwrap(), Some(StatusRecord::processed(42, 0)));
        assert_eq!(fixture.broker.unacked("task_queue"), 0);
        assert_eq!(fixture.broker.depth("task_queue_dlq"), 0);
    }

    #[tokio::test]
    async fn test_processing_failure_goes_to_dlq() {
        let fixture = fixture().await;
        let body = br#"{"order_id": 7, "note": "fail"}"#;
        let transition = deliver(&fixture, body).await;

        assert!(matches!(transition, Transition::DeadLettered { order_id: Some(7), .. }));
        assert!(fixture.store.is_empty());
        let dead = fixture.broker.messages("task_queue_dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, body.to_vec());
    }

    #[tokio::test]
    async fn test_malformed_body_goes_to_dlq() {
        let fixture = fixture().await;
        let transition = deliver(&fixture, b"not json").await;

        assert!(matches!(transition, Transition::DeadLettered { order_id: None, .. }));
        assert_eq!(fixture.store.upsert_calls(), 0);
        assert_eq!(fixture.broker.depth("task_queue_dlq"), 1);
    }

    #[tokio::test]
    async fn test_status_store_outage_still_acks() {
        let fixture = fixture().await;
        fixture.store.set_failing(true);

        let transition = deliver(&fixture, br#"{"order_id": 3}"#).await;

        assert_eq!(transition, Transition::Processed { order_id: 3 });
        assert_eq!(fixture.store.upsert_calls(), 1);
        assert_eq!(fixture.broker.unacked("task_queue"), 0);
        assert_eq!(fixture.broker.depth("task_queue_dlq"), 0);
    }
}
