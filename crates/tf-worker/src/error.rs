use tf_queue::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Task(#[from] tf_common::TaskflowError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
