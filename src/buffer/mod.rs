pub mod error;
pub mod export;
pub mod external;
pub mod inbox;
pub mod journal;
pub mod memory;
pub mod queue;

pub use error::BufferError;
pub use export::{ExportSummary, export_queue};
pub use external::{
    CloudMessage, CloudQueueClient, DEFAULT_QUEUE_NAME_TEMPLATE, ExternalQueueConfig,
    ExternalQueueError, ExternalTaskQueue, LocalCloudQueue, QueueNameTemplate,
};
pub use inbox::Inbox;
pub use journal::{DiskTaskQueue, JournalConfig, JournalError};
pub use memory::{MemoryTaskQueue, OverflowPolicy};
pub use queue::{QueueStats, TaskHandle, TaskQueue};

use crate::domain::{DataSubmissionTask, HandlerKey, QueueInfo, TierKind};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::AsyncWrite;

/// Settings for every storage tier; `QueueInfo` picks which one is used.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub memory_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub journal: JournalConfig,
    pub external: Option<ExternalQueueConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 10_000,
            overflow_policy: OverflowPolicy::Block,
            journal: JournalConfig::default(),
            external: None,
        }
    }
}

/// The task queues of one pipeline, one per shard, all on the same tier.
#[derive(Debug)]
pub struct Buffer {
    key: HandlerKey,
    tier: TierKind,
    sharding_enabled: bool,
    shards: Vec<Arc<TaskQueue>>,
    next_shard: AtomicUsize,
}

impl Buffer {
    pub async fn open(info: &QueueInfo, storage: &StorageConfig) -> Result<Self, BufferError> {
        let key = info.key();
        let mut queues = Vec::with_capacity(info.shards());

        for shard in 0..info.shards() {
            let queue = match info.tier() {
                TierKind::Memory => TaskQueue::Memory(MemoryTaskQueue::new(
                    storage.memory_capacity,
                    storage.overflow_policy,
                )),
                TierKind::Disk => {
                    let dir = storage.journal.queue_dir(key, shard);
                    TaskQueue::Disk(DiskTaskQueue::open(dir, &storage.journal).await?)
                }
                TierKind::External => {
                    let external = storage
                        .external
                        .as_ref()
                        .ok_or(BufferError::TierNotConfigured(TierKind::External))?;
                    let base = external.template.render(
                        &external.identity,
                        key.entity_type(),
                        key.handle(),
                    );
                    let name = if info.shards() > 1 {
                        format!("{base}-{shard}")
                    } else {
                        base
                    };
                    TaskQueue::External(ExternalTaskQueue::new(name, external))
                }
            };
            queues.push(queue);
        }

        tracing::info!(
            pipeline = %key,
            tier = ?info.tier(),
            shards = info.shards(),
            "Opened buffer"
        );
        Ok(Self::from_queues(info, queues))
    }

    /// Wraps already opened queues; `queues` must hold one queue per shard.
    pub fn from_queues(info: &QueueInfo, queues: Vec<TaskQueue>) -> Self {
        Self {
            key: info.key().clone(),
            tier: info.tier(),
            sharding_enabled: info.sharding_enabled(),
            shards: queues.into_iter().map(Arc::new).collect(),
            next_shard: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &HandlerKey {
        &self.key
    }

    pub fn tier(&self) -> TierKind {
        self.tier
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, index: usize) -> Result<Arc<TaskQueue>, BufferError> {
        self.shards
            .get(index)
            .cloned()
            .ok_or(BufferError::ShardOutOfRange {
                shard: index,
                shards: self.shards.len(),
            })
    }

    /// Picks a shard: a stable hash of the ordering key when sharding is
    /// enabled, round-robin otherwise.
    pub fn route(&self, ordering_key: Option<&str>) -> usize {
        let shards = self.shards.len().max(1);
        match ordering_key {
            Some(key) if self.sharding_enabled => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % shards as u64) as usize
            }
            _ => self.next_shard.fetch_add(1, Ordering::Relaxed) % shards,
        }
    }

    pub async fn enqueue(
        &self,
        ordering_key: Option<&str>,
        task: DataSubmissionTask,
    ) -> Result<usize, BufferError> {
        let shard = self.route(ordering_key);
        self.shard(shard)?.append(task).await?;
        Ok(shard)
    }

    /// Number of persisted tasks over all shards.
    pub async fn size(&self) -> Result<usize, BufferError> {
        let mut total = 0;
        for queue in &self.shards {
            total += queue.size().await?;
        }
        Ok(total)
    }

    pub async fn stats(&self) -> Result<Vec<QueueStats>, BufferError> {
        let mut stats = Vec::with_capacity(self.shards.len());
        for queue in &self.shards {
            stats.push(queue.stats().await?);
        }
        Ok(stats)
    }

    /// Drops every persisted, unacknowledged task of this pipeline.
    pub async fn truncate(&self) -> Result<usize, BufferError> {
        let mut cleared = 0;
        for queue in &self.shards {
            cleared += queue.clear().await?;
        }
        tracing::warn!(pipeline = %self.key, tasks = cleared, "Truncated buffer");
        Ok(cleared)
    }

    pub async fn export<W>(&self, sink: &mut W, retain: bool) -> Result<ExportSummary, BufferError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut summary = ExportSummary::default();
        for queue in &self.shards {
            summary += export_queue(queue, sink, retain).await?;
        }
        tracing::info!(
            pipeline = %self.key,
            tasks = summary.tasks,
            items = summary.items,
            retain,
            "Exported buffer"
        );
        Ok(summary)
    }
}
