use super::error::BufferError;
use super::external::ExternalTaskQueue;
use super::journal::DiskTaskQueue;
use super::memory::MemoryTaskQueue;
use crate::domain::{DataSubmissionTask, TierKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a task inside one task queue; valid until the task is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskHandle(pub u64);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub tasks: usize,
    pub items: usize,
    pub oldest: Option<DateTime<Utc>>,
}

/// Ordered task queue of one shard, on one of three storage tiers.
///
/// All tiers share the same contract: `append` is atomic, `peek` and
/// `iterate` leave the queue untouched, `remove` is idempotent and
/// `requeue` replaces a pending task without losing it.
#[derive(Debug)]
pub enum TaskQueue {
    Memory(MemoryTaskQueue),
    Disk(DiskTaskQueue),
    External(ExternalTaskQueue),
}

impl TaskQueue {
    pub fn tier(&self) -> TierKind {
        match self {
            TaskQueue::Memory(_) => TierKind::Memory,
            TaskQueue::Disk(_) => TierKind::Disk,
            TaskQueue::External(_) => TierKind::External,
        }
    }

    /// Appends a task; a full memory tier with the `Block` policy waits here.
    pub async fn append(&self, task: DataSubmissionTask) -> Result<(), BufferError> {
        match self {
            TaskQueue::Memory(q) => q.append(task).await.map(|_| ()),
            TaskQueue::Disk(q) => Ok(q.append(task).await.map(|_| ())?),
            TaskQueue::External(q) => q.append(&task).await,
        }
    }

    /// Appends without ever waiting for space.
    pub async fn try_append(&self, task: DataSubmissionTask) -> Result<(), BufferError> {
        match self {
            TaskQueue::Memory(q) => q.try_append(task).map(|_| ()),
            _ => self.append(task).await,
        }
    }

    pub async fn size(&self) -> Result<usize, BufferError> {
        match self {
            TaskQueue::Memory(q) => Ok(q.size()),
            TaskQueue::Disk(q) => Ok(q.size().await),
            TaskQueue::External(q) => Ok(q.size().await?),
        }
    }

    pub async fn peek(&self) -> Result<Option<(TaskHandle, DataSubmissionTask)>, BufferError> {
        match self {
            TaskQueue::Memory(q) => Ok(q.peek()),
            TaskQueue::Disk(q) => Ok(q.peek().await?),
            TaskQueue::External(q) => Ok(q.peek().await?),
        }
    }

    pub async fn iterate(&self) -> Result<Vec<(TaskHandle, DataSubmissionTask)>, BufferError> {
        match self {
            TaskQueue::Memory(q) => Ok(q.iterate()),
            TaskQueue::Disk(q) => Ok(q.iterate().await?),
            TaskQueue::External(q) => Ok(q.iterate().await?),
        }
    }

    pub async fn remove(&self, handle: TaskHandle) -> Result<(), BufferError> {
        match self {
            TaskQueue::Memory(q) => {
                q.remove(handle);
                Ok(())
            }
            TaskQueue::Disk(q) => Ok(q.remove(handle).await?),
            TaskQueue::External(q) => Ok(q.remove(handle).await?),
        }
    }

    /// Replaces a pending task, e.g. with a higher attempt count. Returns
    /// false when the handle is no longer pending.
    pub async fn requeue(
        &self,
        handle: TaskHandle,
        task: DataSubmissionTask,
    ) -> Result<bool, BufferError> {
        match self {
            TaskQueue::Memory(q) => Ok(q.requeue(handle, task)),
            TaskQueue::Disk(q) => Ok(q.requeue(handle, task).await?),
            TaskQueue::External(q) => q.requeue(handle, &task).await,
        }
    }

    pub async fn clear(&self) -> Result<usize, BufferError> {
        match self {
            TaskQueue::Memory(q) => Ok(q.clear()),
            TaskQueue::Disk(q) => Ok(q.clear().await?),
            TaskQueue::External(q) => Ok(q.clear().await?),
        }
    }

    pub async fn stats(&self) -> Result<QueueStats, BufferError> {
        match self {
            TaskQueue::Memory(q) => Ok(q.stats()),
            TaskQueue::Disk(q) => Ok(q.stats().await),
            TaskQueue::External(q) => Ok(q.stats().await?),
        }
    }
}
