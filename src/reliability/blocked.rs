use crate::domain::EntityType;
use crate::properties::EntityProperties;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

const SAMPLE_PERIOD: Duration = Duration::from_secs(60);
const RECENT_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedSample {
    pub handle: String,
    pub item: String,
    pub reason: String,
}

#[derive(Debug)]
struct SampleWindow {
    started: Instant,
    logged: u64,
    recent: VecDeque<BlockedSample>,
}

/// Bounded diagnostic sink for rejected and dropped items of one entity type.
///
/// At most `blocked_samples_per_minute` items are logged to the entity's
/// blocked-items tracing target; totals are counted regardless.
#[derive(Debug)]
pub struct BlockedSampler {
    entity_type: EntityType,
    props: Arc<EntityProperties>,
    window: Mutex<SampleWindow>,
    total_blocked: AtomicU64,
    total_sampled: AtomicU64,
}

impl BlockedSampler {
    pub fn new(props: Arc<EntityProperties>) -> Self {
        Self {
            entity_type: props.entity_type(),
            props,
            window: Mutex::new(SampleWindow {
                started: Instant::now(),
                logged: 0,
                recent: VecDeque::new(),
            }),
            total_blocked: AtomicU64::new(0),
            total_sampled: AtomicU64::new(0),
        }
    }

    pub fn record(&self, handle: &str, item: &str, reason: &str) {
        self.total_blocked.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let limit = self.props.blocked_samples_per_minute();
        let mut window = self.window.lock();
        if now.saturating_duration_since(window.started) >= SAMPLE_PERIOD {
            window.started = now;
            window.logged = 0;
        }
        if window.logged >= limit {
            return;
        }
        window.logged += 1;
        if window.recent.len() >= RECENT_CAPACITY {
            window.recent.pop_front();
        }
        window.recent.push_back(BlockedSample {
            handle: handle.to_string(),
            item: item.to_string(),
            reason: reason.to_string(),
        });
        drop(window);

        self.total_sampled.fetch_add(1, Ordering::Relaxed);
        match self.entity_type {
            EntityType::Logs => {
                tracing::info!(target: "RawBlockedLogs", handle, reason, "{}", item)
            }
            _ => tracing::info!(target: "RawBlockedPoints", handle, reason, "{}", item),
        }
    }

    pub fn record_all<'a>(&self, handle: &str, items: impl IntoIterator<Item = &'a String>, reason: &str) {
        for item in items {
            self.record(handle, item, reason);
        }
    }

    pub fn total_blocked(&self) -> u64 {
        self.total_blocked.load(Ordering::Relaxed)
    }

    pub fn total_sampled(&self) -> u64 {
        self.total_sampled.load(Ordering::Relaxed)
    }

    pub fn recent_samples(&self) -> Vec<BlockedSample> {
        self.window.lock().recent.iter().cloned().collect()
    }
}
