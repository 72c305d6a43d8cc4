use thiserror::Error;

/// Errors raised while building or decoding domain values.
#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Submission task for {handle} has no items")]
    EmptyTask { handle: String },

    #[error("Invalid shard count {shards} for {handle}")]
    InvalidShardCount { handle: String, shards: usize },

    #[error("Unsupported task format version: {0}")]
    UnsupportedFormat(u8),

    #[error("Task encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Task decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}
