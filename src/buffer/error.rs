use super::external::ExternalQueueError;
use super::journal::JournalError;
use crate::domain::{DomainError, TierKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Task queue is full: {capacity} tasks")]
    QueueFull { capacity: usize },

    #[error("Shard {shard} out of range ({shards} shards)")]
    ShardOutOfRange { shard: usize, shards: usize },

    #[error("Shard {shard} halted: {reason}")]
    Halted { shard: usize, reason: String },

    #[error("Storage tier {0:?} is not configured")]
    TierNotConfigured(TierKind),

    #[error("Buffer export failed: {0}")]
    Export(#[source] std::io::Error),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("External queue error: {0}")]
    External(#[from] ExternalQueueError),

    #[error("Task error: {0}")]
    Task(#[from] DomainError),
}

impl BufferError {
    /// Storage failures that put durability at risk; the shard must halt.
    pub fn is_fatal(&self) -> bool {
        match self {
            BufferError::Journal(_)
            | BufferError::Halted { .. }
            | BufferError::TierNotConfigured(_) => true,
            BufferError::External(e) => !e.is_transient(),
            BufferError::QueueFull { .. }
            | BufferError::ShardOutOfRange { .. }
            | BufferError::Export(_)
            | BufferError::Task(_) => false,
        }
    }
}
