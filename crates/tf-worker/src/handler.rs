//! Processing seam between the consumers and the actual work

use std::time::Duration;

use async_trait::async_trait;
use tf_common::Task;
use thiserror::Error;

/// Which delivery of a task is being processed.
///
/// `number` is 0 on the main queue and `retry_counter + 1` on the DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub max: u32,
}

impl Attempt {
    pub fn first(max: u32) -> Self {
        Self { number: 0, max }
    }

    pub fn is_final(&self) -> bool {
        self.number >= self.max
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProcessingError(pub String);

impl ProcessingError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// `body` is the delivery exactly as received; `task` is its parsed form.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        task: &Task,
        body: &[u8],
        attempt: Attempt,
    ) -> Result<(), ProcessingError>;
}

/// Stand-in for domain work: takes a fixed amount of time and fails on
/// any delivery whose raw body contains the failure marker.
pub struct SimulatedProcessing {
    work: Duration,
    failure_marker: String,
}

impl SimulatedProcessing {
    pub fn new(work: Duration, failure_marker: impl Into<String>) -> Self {
        Self {
            work,
            failure_marker: failure_marker.into(),
        }
    }

    fn marked(&self, body: &[u8]) -> bool {
        let marker = self.failure_marker.as_bytes();
        !marker.is_empty() && body.windows(marker.len()).any(|w| w == marker)
    }
}

#[async_trait]
impl TaskHandler for SimulatedProcessing {
    async fn handle(
        &self,
        _task: &Task,
        body: &[u8],
        _attempt: Attempt,
    ) -> Result<(), ProcessingError> {
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }

        if self.marked(body) {
            return Err(ProcessingError::new("Simulated processing failure"));
        }
        Ok(())
    }
}

/// Default DLQ behaviour: every retry below the limit fails and the final
/// attempt succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct FinalAttemptSucceeds;

#[async_trait]
impl TaskHandler for FinalAttemptSucceeds {
    async fn handle(
        &self,
        _task: &Task,
        _body: &[u8],
        attempt: Attempt,
    ) -> Result<(), ProcessingError> {
        if attempt.is_final() {
            Ok(())
        } else {
            Err(ProcessingError::new("Simulated failure"))
        }
    }
}
