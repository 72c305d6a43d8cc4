//! Domain layer for telemetry-proxy.
//!
//! Contains the canonical types shared across all modules:
//! - `EntityType` and `HandlerKey`: pipeline identity
//! - `QueueInfo`: how a pipeline's queues are laid out
//! - `DataSubmissionTask`: the persisted unit of delivery work

pub mod entity;
pub mod error;
pub mod handler_key;
pub mod task;

pub use entity::EntityType;
pub use error::DomainError;
pub use handler_key::{HandlerKey, QueueInfo, TierKind};
pub use task::{DataSubmissionTask, Item, QueueingReason, TASK_FORMAT_VERSION};
