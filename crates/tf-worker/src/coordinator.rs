use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tf_common::{retry_count_from, with_retry_count, Task};
use tf_queue::{BrokerGateway, OutboundMessage, QueueConsumer, QueuedMessage};
use tf_store::{QuarantineEntry, QuarantineStore, StatusRecord, StatusStore};
use tracing::{error, info, warn};

use crate::completion::CompletionPublisher;
use crate::error::Result;
use crate::handler::{Attempt, FinalAttemptSucceeds, TaskHandler};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::{DeliveryHandler, Transition};

/// DLQ consumer logic.
///
/// Every delivery ends in exactly one of: dropped (unparseable), retried,
/// quarantined or completed, and is acked in all four. Store and completion
/// failures are logged without affecting the ack. Only broker failures leave
/// the delivery unsettled.
pub struct RetryCoordinator {
    policy: RetryPolicy,
    handler: Arc<dyn TaskHandler>,
    broker: Arc<dyn BrokerGateway>,
    main_queue: String,
    status_store: Arc<dyn StatusStore>,
    quarantine_store: Arc<dyn QuarantineStore>,
    completion: CompletionPublisher,
}

impl RetryCoordinator {
    pub fn new(
        policy: RetryPolicy,
        broker: Arc<dyn BrokerGateway>,
        main_queue: impl Into<String>,
        status_store: Arc<dyn StatusStore>,
        quarantine_store: Arc<dyn QuarantineStore>,
        completion: CompletionPublisher,
    ) -> Self {
        Self {
            policy,
            handler: Arc::new(FinalAttemptSucceeds),
            broker,
            main_queue: main_queue.into(),
            status_store,
            quarantine_store,
            completion,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handler = handler;
        self
    }

    async fn drop_malformed(
        &self,
        message: &QueuedMessage,
        consumer: &dyn QueueConsumer,
        reason: String,
    ) -> Result<Transition> {
        error!(body = %message.body_lossy(), error = %reason, "Invalid task on DLQ, dropping");
        consumer.ack(&message.receipt_handle).await?;
        counter!("tf_dlq_dropped_total").increment(1);
        Ok(Transition::Dropped { reason })
    }

    async fn retry(
        &self,
        message: &QueuedMessage,
        consumer: &dyn QueueConsumer,
        task: &Task,
        next_count: u32,
        backoff: std::time::Duration,
    ) -> Result<Transition> {
        info!(
            order_id = task.order_id,
            attempt = next_count,
            backoff_secs = backoff.as_secs_f64(),
            "Waiting before retry"
        );
        histogram!("tf_dlq_backoff_seconds").record(backoff.as_secs_f64());
        tokio::time::sleep(backoff).await;

        // Body goes back byte-for-byte; only the counter header changes
        let outbound = OutboundMessage::persistent(message.body.clone())
            .with_headers(with_retry_count(&message.headers, next_count));
        self.broker.publish(&self.main_queue, outbound).await?;
        consumer.ack(&message.receipt_handle).await?;

        counter!("tf_dlq_retries_total").increment(1);
        info!(
            order_id = task.order_id,
            queue = %self.main_queue,
            retry_count = next_count,
            "Task requeued"
        );
        Ok(Transition::Retried {
            order_id: task.order_id,
            next_count,
            backoff,
        })
    }

    async fn quarantine(
        &self,
        message: &QueuedMessage,
        consumer: &dyn QueueConsumer,
        task: Task,
        retry_count: u32,
    ) -> Result<Transition> {
        let task = task.quarantined(retry_count);
        error!(order_id = task.order_id, retry_count, "Max retries reached, quarantining task");

        match self.quarantine_store.append(&QuarantineEntry::from_task(&task)).await {
            Ok(id) => info!(order_id = task.order_id, id, "Quarantine record written"),
            Err(e) => error!(
                order_id = task.order_id,
                store = %self.quarantine_store.identifier(),
                error = %e,
                "Failed to write quarantine record"
            ),
        }

        consumer.ack(&message.receipt_handle).await?;
        counter!("tf_dlq_quarantined_total").increment(1);
        Ok(Transition::Quarantined {
            order_id: task.order_id,
            retry_count,
        })
    }

    async fn complete(
        &self,
        message: &QueuedMessage,
        consumer: &dyn QueueConsumer,
        task: Task,
        retry_count: u32,
    ) -> Result<Transition> {
        let task = task.completed(retry_count);

        match self.status_store.upsert(&StatusRecord::from_task(&task)).await {
            Ok(()) => info!(order_id = task.order_id, retry_count, "Status record updated"),
            Err(e) => warn!(
                order_id = task.order_id,
                store = %self.status_store.identifier(),
                error = %e,
                "Status upsert failed"
            ),
        }
        self.completion.publish(&task).await;

        consumer.ack(&message.receipt_handle).await?;
        counter!("tf_dlq_completed_total").increment(1);
        info!(order_id = task.order_id, retry_count, "Task reprocessed");
        Ok(Transition::Completed {
            order_id: task.order_id,
            retry_count,
        })
    }
}

#[async_trait]
impl DeliveryHandler for RetryCoordinator {
    async fn handle(
        &self,
        message: QueuedMessage,
        consumer: &dyn QueueConsumer,
    ) -> Result<Transition> {
        let task = match Task::parse(&message.body) {
            Ok(task) => task,
            Err(e) => return self.drop_malformed(&message, consumer, e.to_string()).await,
        };

        let attempt = self.policy.attempt_for(retry_count_from(&message.headers));
        info!(
            order_id = task.order_id,
            attempt,
            max_retries = self.policy.max_retries,
            "Retrying task from DLQ"
        );

        let outcome = self
            .handler
            .handle(
                &task,
                &message.body,
                Attempt {
                    number: attempt,
                    max: self.policy.max_retries,
                },
            )
            .await;
        if let Err(e) = &outcome {
            warn!(order_id = task.order_id, attempt, error = %e, "Retry attempt failed");
        }

        match self.policy.decide(attempt, &outcome) {
            RetryDecision::Retry { next_count, backoff } => {
                self.retry(&message, consumer, &task, next_count, backoff).await
            }
            RetryDecision::Quarantine { retry_count } => {
                self.quarantine(&message, consumer, task, retry_count).await
            }
            RetryDecision::Complete { retry_count } => {
                self.complete(&message, consumer, task, retry_count).await
            }
        }
    }
}
