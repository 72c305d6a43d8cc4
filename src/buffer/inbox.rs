use crate::domain::Item;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// Fresh items of one shard waiting for their first submission.
///
/// The item bound is passed on every push so a runtime change to the memory
/// buffer limit applies immediately.
#[derive(Debug, Default)]
pub struct Inbox {
    items: Mutex<VecDeque<Item>>,
    space: Notify,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Accepts items in order until `limit` is reached and hands back the rest.
    pub fn push_within(&self, items: Vec<Item>, limit: usize) -> Vec<Item> {
        let mut queue = self.items.lock();
        let room = limit.saturating_sub(queue.len());
        if items.len() <= room {
            queue.extend(items);
            return Vec::new();
        }

        let mut items = items;
        let rest = items.split_off(room);
        queue.extend(items);
        rest
    }

    pub fn take(&self, max: usize) -> Vec<Item> {
        let taken: Vec<Item> = {
            let mut queue = self.items.lock();
            let n = max.min(queue.len());
            queue.drain(..n).collect()
        };
        if !taken.is_empty() {
            self.space.notify_waiters();
        }
        taken
    }

    pub fn drain(&self) -> Vec<Item> {
        self.take(usize::MAX)
    }

    /// Resolves on the next `take`. Create it before retrying a push so a
    /// concurrent take is not missed.
    pub fn space_available(&self) -> Notified<'_> {
        self.space.notified()
    }
}
