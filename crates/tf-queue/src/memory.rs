//! In-process broker
//!
//! FIFO queues with unacked tracking and dead-letter routing, following the
//! same ack/nack contract as the AMQP backend. Used by tests and local runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tf_common::Headers;
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    BrokerGateway, OutboundMessage, QueueConsumer, QueueError, QueueSpec, QueuedMessage, Result,
};

/// A copy of a message sitting in a queue
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSnapshot {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub persistent: bool,
    pub redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<MessageSnapshot>,
    unacked: HashMap<String, MessageSnapshot>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    failing_publishes: HashSet<String>,
}

struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
    next_tag: AtomicU64,
    poll_wait: Duration,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_poll_wait(Duration::from_millis(100))
    }

    pub fn with_poll_wait(poll_wait: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                next_tag: AtomicU64::new(1),
                poll_wait,
            }),
        }
    }

    /// Messages ready for delivery
    pub fn depth(&self, queue: &str) -> usize {
        let state = self.inner.state.lock();
        state.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Deliveries handed out but not yet acked or nacked
    pub fn unacked(&self, queue: &str) -> usize {
        let state = self.inner.state.lock();
        state.queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    /// Ready messages in delivery order, without consuming them
    pub fn messages(&self, queue: &str) -> Vec<MessageSnapshot> {
        let state = self.inner.state.lock();
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every publish to `queue` fail until cleared
    pub fn set_publish_failure(&self, queue: &str, failing: bool) {
        let mut state = self.inner.state.lock();
        if failing {
            state.failing_publishes.insert(queue.to_string());
        } else {
            state.failing_publishes.remove(queue);
        }
    }

    fn settle(&self, queue: &str, receipt_handle: &str, requeue: Option<bool>) -> Result<()> {
        let mut state = self.inner.state.lock();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        let mut message = queue_state
            .unacked
            .remove(receipt_handle)
            .ok_or_else(|| QueueError::UnknownReceipt(receipt_handle.to_string()))?;

        match requeue {
            None => {}
            Some(true) => {
                message.redelivered = true;
                queue_state.ready.push_front(message);
            }
            Some(false) => {
                if let Some(target) = queue_state.spec.dead_letter_to.clone() {
                    match state.queues.get_mut(&target) {
                        Some(dlq) => {
                            debug!(from = %queue, to = %target, "Dead-lettering message");
                            message.redelivered = false;
                            dlq.ready.push_back(message);
                        }
                        None => {
                            debug!(queue = %target, "Dead-letter target missing, message dropped")
                        }
                    }
                }
            }
        }
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    fn take_ready(&self, queue: &str, max_messages: u32) -> Result<Vec<QueuedMessage>> {
        let mut state = self.inner.state.lock();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;

        let mut taken = Vec::new();
        while taken.len() < max_messages as usize {
            let Some(message) = queue_state.ready.pop_front() else { break };
            let receipt_handle = self.inner.next_tag.fetch_add(1, Ordering::SeqCst).to_string();
            taken.push(QueuedMessage {
                body: message.body.clone(),
                headers: message.headers.clone(),
                receipt_handle: receipt_handle.clone(),
                redelivered: message.redelivered,
                queue_identifier: queue.to_string(),
            });
            queue_state.unacked.insert(receipt_handle, message);
        }
        Ok(taken)
    }
}

#[async_trait]
impl BrokerGateway for InMemoryBroker {
    fn identifier(&self) -> &str {
        "memory"
    }

    async fn declare(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.queues.entry(spec.name.clone()).or_insert_with(|| QueueState {
            spec: spec.clone(),
            ready: VecDeque::new(),
            unacked: HashMap::new(),
        });
        Ok(())
    }

    async fn consumer(&self, queue: &str) -> Result<Arc<dyn QueueConsumer>> {
        if !self.inner.state.lock().queues.contains_key(queue) {
            return Err(QueueError::UnknownQueue(queue.to_string()));
        }
        Ok(Arc::new(InMemoryConsumer {
            broker: self.clone(),
            queue: queue.to_string(),
            stopped: AtomicBool::new(false),
        }))
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.failing_publishes.contains(queue) {
                return Err(QueueError::Publish(format!("publish to {} rejected", queue)));
            }
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
            queue_state.ready.push_back(MessageSnapshot {
                body: message.body,
                headers: message.headers,
                persistent: message.persistent,
                redelivered: false,
            });
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) {}
}

pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    queue: String,
    stopped: AtomicBool,
}

#[async_trait]
impl QueueConsumer for InMemoryConsumer {
    fn identifier(&self) -> &str {
        &self.queue
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let messages = self.broker.take_ready(&self.queue, max_messages)?;
        if !messages.is_empty() {
            return Ok(messages);
        }

        let inner = &self.broker.inner;
        let _ = tokio::time::timeout(inner.poll_wait, inner.notify.notified()).await;
        self.broker.take_ready(&self.queue, max_messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.broker.settle(&self.queue, receipt_handle, None)
    }

    async fn nack(&self, receipt_handle: &str, requeue: bool) -> Result<()> {
        self.broker.settle(&self.queue, receipt_handle, Some(requeue))
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.broker.inner.notify.notify_waiters();
    }
}
