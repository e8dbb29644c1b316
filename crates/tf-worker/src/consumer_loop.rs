use std::sync::Arc;
use std::time::Duration;

use tf_queue::{QueueConsumer, QueueError};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::DeliveryHandler;

/// Single-delivery consumption loop.
///
/// Each delivery is handled to completion, backoff sleeps included, before
/// the next poll. Shutdown is observed between deliveries only.
pub struct ConsumerLoop {
    consumer: Arc<dyn QueueConsumer>,
    handler: Arc<dyn DeliveryHandler>,
    poll_error_delay: Duration,
}

impl ConsumerLoop {
    pub fn new(consumer: Arc<dyn QueueConsumer>, handler: Arc<dyn DeliveryHandler>) -> Self {
        Self {
            consumer,
            handler,
            poll_error_delay: Duration::from_secs(1),
        }
    }

    /// Run until shutdown is broadcast or the consumer stops.
    ///
    /// Returns the number of deliveries handled. A delivery whose handler
    /// fails is requeued after a short pause.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> u64 {
        let queue = self.consumer.identifier().to_string();
        info!(queue = %queue, "Consumer loop started");
        let mut handled = 0u64;

        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!(queue = %queue, "Consumer loop shutting down");
                    break;
                }
                result = self.consumer.poll(1) => result,
            };

            let mut stopping = false;
            match polled {
                Ok(messages) => {
                    for message in messages {
                        let receipt = message.receipt_handle.clone();
                        match self.handler.handle(message, self.consumer.as_ref()).await {
                            Ok(transition) => {
                                debug!(queue = %queue, ?transition, "Delivery settled")
                            }
                            Err(e) => {
                                error!(
                                    queue = %queue,
                                    receipt = %receipt,
                                    error = %e,
                                    "Delivery failed, returning it to the queue"
                                );
                                stopping = self.requeue_failed(&receipt, &mut shutdown).await;
                            }
                        }
                        handled += 1;
                    }
                }
                Err(QueueError::Stopped) => {
                    info!(queue = %queue, "Consumer stopped");
                    break;
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "Error polling");
                    tokio::select! {
                        _ = shutdown.recv() => stopping = true,
                        _ = tokio::time::sleep(self.poll_error_delay) => {}
                    }
                }
            }
            if stopping {
                info!(queue = %queue, "Consumer loop shutting down");
                break;
            }
        }

        self.consumer.stop().await;
        info!(queue = %queue, handled, "Consumer loop stopped");
        handled
    }

    /// Pause, then hand an unsettled delivery back to the broker. With a
    /// prefetch of one, an unsettled delivery blocks the whole consumer.
    /// Returns whether shutdown was signalled during the pause.
    async fn requeue_failed(&self, receipt: &str, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let stopping = tokio::select! {
            _ = shutdown.recv() => true,
            _ = tokio::time::sleep(self.poll_error_delay) => false,
        };
        if let Err(e) = self.consumer.nack(receipt, true).await {
            error!(
                queue = %self.consumer.identifier(),
                receipt = %receipt,
                error = %e,
                "Failed to requeue delivery"
            );
        }
        stopping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tf_queue::{BrokerGateway, InMemoryBroker, OutboundMessage, QueueSpec, QueuedMessage};

    use tf_common::retry_count_from;
    use tf_store::{InMemoryQuarantineStore, InMemoryStatusStore};

    use crate::error::{Result, WorkerError};
    use crate::{BackoffPolicy, CompletionPublisher, RetryCoordinator, RetryPolicy, Transition};

    /// Acks even bodies. Odd bodies fail unsettled on first delivery and
    /// are acked once redelivered.
    struct ParityHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryHandler for ParityHandler {
        async fn handle(
            &self,
            message: QueuedMessage,
            consumer: &dyn QueueConsumer,
        ) -> Result<Transition> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if message.body[0] % 2 == 1 && !message.redelivered {
                return Err(WorkerError::Queue(QueueError::Publish("odd".to_string())));
            }
            consumer.ack(&message.receipt_handle).await?;
            Ok(Transition::Processed {
                order_id: i64::from(message.body[0]),
            })
        }
    }

    async fn broker_with(bodies: &[u8]) -> InMemoryBroker {
        let broker = InMemoryBroker::with_poll_wait(Duration::from_millis(5));
        broker.declare(&QueueSpec::durable("q")).await.unwrap();
        for body in bodies {
            broker
                .publish("q", OutboundMessage::persistent(vec![*body]))
                .await
                .unwrap();
        }
        broker
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_is_requeued_and_redelivered() {
        let broker = broker_with(&[2, 3, 4]).await;
        let handler = Arc::new(ParityHandler {
            calls: AtomicUsize::new(0),
        });
        let consumer_loop =
            ConsumerLoop::new(broker.consumer("q").await.unwrap(), handler.clone());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(consumer_loop.run(shutdown_rx));

        while handler.calls.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send(()).unwrap();
        let handled = task.await.unwrap();

        assert_eq!(handled, 4);
        assert_eq!(broker.depth("q"), 0);
        assert_eq!(broker.unacked("q"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_shutdown_skips_polling() {
        let broker = broker_with(&[3]).await;
        let handler = Arc::new(ParityHandler {
            calls: AtomicUsize::new(0),
        });
        let consumer_loop =
            ConsumerLoop::new(broker.consumer("q").await.unwrap(), handler.clone());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        shutdown_tx.send(()).unwrap();
        // Shutdown is already pending, so the first poll never happens
        assert_eq!(consumer_loop.run(shutdown_rx).await, 0);
        assert_eq!(broker.depth("q"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dlq_delivery_recovers_after_requeue_failure() {
        let broker = InMemoryBroker::with_poll_wait(Duration::from_millis(5));
        broker.declare(&QueueSpec::durable("dlq")).await.unwrap();
        broker
            .declare(&QueueSpec::durable("main").with_dead_letter("dlq"))
            .await
            .unwrap();
        broker
            .publish("dlq", OutboundMessage::persistent(br#"{"order_id": 1}"#.to_vec()))
            .await
            .unwrap();
        broker.set_publish_failure("main", true);

        let gateway: Arc<dyn BrokerGateway> = Arc::new(broker.clone());
        let coordinator = RetryCoordinator::new(
            RetryPolicy::new(3, BackoffPolicy::exponential()),
            gateway.clone(),
            "main",
            Arc::new(InMemoryStatusStore::new()),
            Arc::new(InMemoryQuarantineStore::new()),
            CompletionPublisher::new(gateway, "status"),
        );
        let consumer_loop =
            ConsumerLoop::new(broker.consumer("dlq").await.unwrap(), Arc::new(coordinator));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(consumer_loop.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.depth("main"), 0);

        broker.set_publish_failure("main", false);
        while broker.depth("main") == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        let requeued = broker.messages("main");
        assert_eq!(requeued.len(), 1);
        assert_eq!(retry_count_from(&requeued[0].headers), 1);
        assert_eq!(broker.depth("dlq"), 0);
        assert_eq!(broker.unacked("dlq"), 0);
    }

    #[tokio::test]
    async fn test_exits_when_consumer_stops() {
        let broker = broker_with(&[]).await;
        let consumer = broker.consumer("q").await.unwrap();
        let handler = Arc::new(ParityHandler {
            calls: AtomicUsize::new(0),
        });
        let consumer_loop = ConsumerLoop::new(consumer.clone(), handler);

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        consumer.stop().await;

        assert_eq!(consumer_loop.run(shutdown_rx).await, 0);
    }
}
