use super::error::BufferError;
use super::queue::{QueueStats, TaskHandle};
use crate::domain::DataSubmissionTask;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// What a full memory tier does with a new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait until a task is removed.
    Block,
    /// Evict the oldest task to make room.
    DropOldest,
    /// Refuse the incoming task.
    DropNewest,
}

#[derive(Debug)]
struct MemoryState {
    next_handle: u64,
    tasks: VecDeque<(TaskHandle, DataSubmissionTask)>,
}

/// Bounded in-process task queue.
#[derive(Debug)]
pub struct MemoryTaskQueue {
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<MemoryState>,
    space: Notify,
    dropped_tasks: AtomicU64,
}

impl MemoryTaskQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            state: Mutex::new(MemoryState {
                next_handle: 0,
                tasks: VecDeque::new(),
            }),
            space: Notify::new(),
            dropped_tasks: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped_tasks(&self) -> u64 {
        self.dropped_tasks.load(Ordering::Relaxed)
    }

    /// Appends according to the overflow policy; blocks under `Block`.
    pub async fn append(&self, task: DataSubmissionTask) -> Result<TaskHandle, BufferError> {
        let mut task = task;
        loop {
            let notified = self.space.notified();
            match self.offer(task) {
                Ok(handle) => return Ok(handle),
                Err(Rejected::Full(returned)) if self.policy == OverflowPolicy::Block => {
                    task = returned;
                    notified.await;
                }
                Err(_) => {
                    return Err(BufferError::QueueFull {
                        capacity: self.capacity,
                    });
                }
            }
        }
    }

    /// Appends without waiting; a full queue under `Block` refuses the task.
    pub fn try_append(&self, task: DataSubmissionTask) -> Result<TaskHandle, BufferError> {
        self.offer(task).map_err(|_| BufferError::QueueFull {
            capacity: self.capacity,
        })
    }

    fn offer(&self, task: DataSubmissionTask) -> Result<TaskHandle, Rejected> {
        let mut state = self.state.lock();
        if state.tasks.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Block => return Err(Rejected::Full(task)),
                OverflowPolicy::DropNewest => {
                    self.dropped_tasks.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        handle = task.handle(),
                        items = task.len(),
                        "Memory queue full, dropping newest task"
                    );
                    return Err(Rejected::Dropped);
                }
                OverflowPolicy::DropOldest => {
                    if let Some((_, evicted)) = state.tasks.pop_front() {
                        self.dropped_tasks.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            handle = evicted.handle(),
                            items = evicted.len(),
                            "Memory queue full, dropping oldest task"
                        );
                    }
                }
            }
        }

        let handle = TaskHandle(state.next_handle);
        state.next_handle += 1;
        state.tasks.push_back((handle, task));
        Ok(handle)
    }

    pub fn size(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn peek(&self) -> Option<(TaskHandle, DataSubmissionTask)> {
        self.state.lock().tasks.front().cloned()
    }

    pub fn iterate(&self) -> Vec<(TaskHandle, DataSubmissionTask)> {
        self.state.lock().tasks.iter().cloned().collect()
    }

    pub fn remove(&self, handle: TaskHandle) {
        let removed = {
            let mut state = self.state.lock();
            match state.tasks.iter().position(|(h, _)| *h == handle) {
                Some(index) => state.tasks.remove(index).is_some(),
                None => false,
            }
        };
        if removed {
            self.space.notify_waiters();
        }
    }

    pub fn requeue(&self, handle: TaskHandle, task: DataSubmissionTask) -> bool {
        let mut state = self.state.lock();
        match state.tasks.iter_mut().find(|(h, _)| *h == handle) {
            Some(slot) => {
                slot.1 = task;
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) -> usize {
        let cleared = {
            let mut state = self.state.lock();
            let count = state.tasks.len();
            state.tasks.clear();
            count
        };
        self.space.notify_waiters();
        cleared
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            tasks: state.tasks.len(),
            items: state.tasks.iter().map(|(_, t)| t.len()).sum(),
            oldest: state.tasks.iter().map(|(_, t)| t.enqueued_at()).min(),
        }
    }
}

enum Rejected {
    Full(DataSubmissionTask),
    Dropped,
}
