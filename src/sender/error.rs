use crate::buffer::BufferError;
use crate::domain::{DomainError, HandlerKey};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FactoryError {
    #[error("Sender tasks already created for {0}")]
    AlreadyCreated(HandlerKey),

    #[error("Pipeline {0} is shut down")]
    ShutDown(HandlerKey),

    #[error("No pipeline for {0}")]
    NotFound(HandlerKey),

    #[error("Buffer for {buffer} does not match queue {queue}")]
    KeyMismatch { queue: HandlerKey, buffer: HandlerKey },

    #[error("Buffer has {actual} shards, queue {key} expects {expected}")]
    ShardMismatch {
        key: HandlerKey,
        expected: usize,
        actual: usize,
    },

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Pipeline {0} is shut down")]
    ShutDown(HandlerKey),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Task error: {0}")]
    Task(#[from] DomainError),
}
