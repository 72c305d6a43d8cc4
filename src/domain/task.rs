use super::entity::EntityType;
use super::error::DomainError;
use super::handler_key::HandlerKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque telemetry entry in its wire form (a point line, a span, a log record).
pub type Item = String;

/// Version byte prefixed to every persisted task.
pub const TASK_FORMAT_VERSION: u8 = 1;

/// Why a task ended up in a task queue instead of being delivered directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueingReason {
    RateLimited,
    BufferFull,
    SubmissionError,
    BackendRejected,
    ShutdownDrain,
}

impl QueueingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueingReason::RateLimited => "RATE_LIMITED",
            QueueingReason::BufferFull => "BUFFER_FULL",
            QueueingReason::SubmissionError => "SUBMISSION_ERROR",
            QueueingReason::BackendRejected => "BACKEND_REJECTED",
            QueueingReason::ShutdownDrain => "SHUTDOWN_DRAIN",
        }
    }
}

impl fmt::Display for QueueingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One batch of items plus the metadata needed to deliver it later.
///
/// A task always holds at least one item, and its attempt counter only ever
/// grows: every constructor that derives a task from another one keeps or
/// increments `attempts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSubmissionTask {
    items: Vec<Item>,
    entity_type: EntityType,
    handle: String,
    attempts: u32,
    enqueued_at_ms: i64,
    reason: Option<QueueingReason>,
}

impl DataSubmissionTask {
    pub fn new(key: &HandlerKey, items: Vec<Item>) -> Result<Self, DomainError> {
        if items.is_empty() {
            return Err(DomainError::EmptyTask {
                handle: key.to_string(),
            });
        }

        Ok(Self {
            items,
            entity_type: key.entity_type(),
            handle: key.handle().to_string(),
            attempts: 0,
            enqueued_at_ms: Utc::now().timestamp_millis(),
            reason: None,
        })
    }

    pub fn key(&self) -> HandlerKey {
        HandlerKey::new(self.entity_type, self.handle.clone())
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Item> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reason(&self) -> Option<QueueingReason> {
        self.reason
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.enqueued_at_ms).unwrap_or_default()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.enqueued_at()).to_std().unwrap_or_default()
    }

    /// Tags the task with the reason it is being persisted.
    pub fn queued(mut self, reason: QueueingReason) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Records one more failed delivery attempt.
    pub fn retried(mut self, reason: QueueingReason) -> Self {
        self.attempts = self.attempts.saturating_add(1);
        self.reason = Some(reason);
        self
    }

    /// Derives a task holding a subset of this task's items.
    pub fn with_items(&self, items: Vec<Item>) -> Result<Self, DomainError> {
        if items.is_empty() {
            return Err(DomainError::EmptyTask {
                handle: self.key().to_string(),
            });
        }

        Ok(Self {
            items,
            entity_type: self.entity_type,
            handle: self.handle.clone(),
            attempts: self.attempts,
            enqueued_at_ms: self.enqueued_at_ms,
            reason: self.reason,
        })
    }

    /// Splits the task into two halves; `None` when only one item is left.
    pub fn split(&self) -> Option<(Self, Self)> {
        if self.items.len() < 2 {
            return None;
        }

        let mid = self.items.len() / 2;
        let (head, tail) = self.items.split_at(mid);
        let first = self.with_items(head.to_vec()).ok()?;
        let second = self.with_items(tail.to_vec()).ok()?;
        Some((first, second))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DomainError> {
        let mut bytes = vec![TASK_FORMAT_VERSION];
        bytes.extend(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DomainError> {
        let (version, body) = bytes
            .split_first()
            .ok_or(DomainError::UnsupportedFormat(0))?;
        if *version != TASK_FORMAT_VERSION {
            return Err(DomainError::UnsupportedFormat(*version));
        }

        let (task, _): (Self, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())?;
        if task.items.is_empty() {
            return Err(DomainError::EmptyTask {
                handle: task.key().to_string(),
            });
        }
        Ok(task)
    }
}
