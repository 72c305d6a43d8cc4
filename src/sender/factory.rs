use super::api::BackendApi;
use super::error::FactoryError;
use super::handle::{DrainSummary, PipelineHandle, PipelineShared};
use super::task::{SenderContext, SenderTask, ShardState};
use crate::buffer::{Buffer, ExportSummary, Inbox, TaskQueue};
use crate::domain::{HandlerKey, QueueInfo};
use crate::properties::PropertiesRegistry;
use crate::reliability::{
    BlockedSampler, EntityGovernors, HealthConfig, HealthReport, MetricsCollector, RateLimiter,
};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Uncreated,
    Running,
    /// Terminal; the key cannot be reused.
    ShutDown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownSummary {
    pub pipelines: usize,
    /// Workers aborted after the shutdown timeout.
    pub abandoned_workers: usize,
    pub drained_items: usize,
    pub dropped_items: usize,
}

impl std::ops::AddAssign for ShutdownSummary {
    fn add_assign(&mut self, other: Self) {
        self.pipelines += other.pipelines;
        self.abandoned_workers += other.abandoned_workers;
        self.drained_items += other.drained_items;
        self.dropped_items += other.dropped_items;
    }
}

#[derive(Debug)]
struct RunningPipeline {
    handle: PipelineHandle,
    workers: Vec<JoinHandle<()>>,
}

#[derive(Debug)]
enum PipelineSlot {
    Running(RunningPipeline),
    ShutDown,
}

/// Creates and owns the sender tasks and buffer of every pipeline.
pub struct SenderTaskFactory {
    backend: Arc<dyn BackendApi>,
    properties: PropertiesRegistry,
    governors: EntityGovernors,
    metrics: Arc<MetricsCollector>,
    shutdown_timeout: Duration,
    pipelines: Mutex<HashMap<HandlerKey, PipelineSlot>>,
}

impl std::fmt::Debug for SenderTaskFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderTaskFactory")
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("pipelines", &self.pipelines.lock().len())
            .finish_non_exhaustive()
    }
}

impl SenderTaskFactory {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        properties: PropertiesRegistry,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let governors = EntityGovernors::new(&properties);
        Self {
            backend,
            properties,
            governors,
            metrics,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn properties(&self) -> &PropertiesRegistry {
        &self.properties
    }

    pub fn governors(&self) -> &EntityGovernors {
        &self.governors
    }

    pub fn state(&self, key: &HandlerKey) -> PipelineState {
        match self.pipelines.lock().get(key) {
            None => PipelineState::Uncreated,
            Some(PipelineSlot::Running(_)) => PipelineState::Running,
            Some(PipelineSlot::ShutDown) => PipelineState::ShutDown,
        }
    }

    pub fn handle(&self, key: &HandlerKey) -> Option<PipelineHandle> {
        match self.pipelines.lock().get(key) {
            Some(PipelineSlot::Running(running)) => Some(running.handle.clone()),
            _ => None,
        }
    }

    /// Handles of all running pipelines, ordered by key.
    pub fn handles(&self) -> Vec<PipelineHandle> {
        let mut handles: Vec<_> = self
            .pipelines
            .lock()
            .values()
            .filter_map(|slot| match slot {
                PipelineSlot::Running(running) => Some(running.handle.clone()),
                PipelineSlot::ShutDown => None,
            })
            .collect();
        handles.sort_by(|a, b| a.key().cmp(b.key()));
        handles
    }

    /// Starts one sender task per shard of `buffer`. Must be called from
    /// within a tokio runtime.
    pub fn create_sender_tasks(
        &self,
        info: &QueueInfo,
        buffer: Buffer,
    ) -> Result<PipelineHandle, FactoryError> {
        let key = info.key();
        if buffer.key() != key {
            return Err(FactoryError::KeyMismatch {
                queue: key.clone(),
                buffer: buffer.key().clone(),
            });
        }
        if buffer.shard_count() != info.shards() {
            return Err(FactoryError::ShardMismatch {
                key: key.clone(),
                expected: info.shards(),
                actual: buffer.shard_count(),
            });
        }

        let mut pipelines = self.pipelines.lock();
        if pipelines.contains_key(key) {
            return Err(FactoryError::AlreadyCreated(key.clone()));
        }

        let entity = key.entity_type();
        let props = self.properties.get(entity);
        let ctx = SenderContext {
            key: key.clone(),
            props: Arc::clone(&props),
            limiter: self
                .governors
                .limiter(entity)
                .unwrap_or_else(|| Arc::new(RateLimiter::new(Arc::clone(&props)))),
            sampler: self
                .governors
                .sampler(entity)
                .unwrap_or_else(|| Arc::new(BlockedSampler::new(Arc::clone(&props)))),
            metrics: self.metrics.pipeline(key),
            backend: Arc::clone(&self.backend),
        };

        let buffer = Arc::new(buffer);
        let cancel = CancellationToken::new();
        let shard_count = info.shards();
        let inboxes: Vec<_> = (0..shard_count).map(|_| Arc::new(Inbox::new())).collect();
        let shards: Vec<_> = (0..shard_count).map(|_| Arc::new(ShardState::new())).collect();

        let mut workers = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let task = SenderTask::new(
                ctx.clone(),
                shard,
                buffer.shard(shard)?,
                Arc::clone(&inboxes[shard]),
                Arc::clone(&shards[shard]),
                cancel.clone(),
            );
            workers.push(tokio::spawn(task.run()));
        }

        let handle = PipelineHandle {
            inner: Arc::new(PipelineShared {
                ctx,
                buffer,
                inboxes,
                shards,
                cancel,
            }),
        };
        pipelines.insert(
            key.clone(),
            PipelineSlot::Running(RunningPipeline {
                handle: handle.clone(),
                workers,
            }),
        );

        info!(
            pipeline = %key,
            shards = shard_count,
            tier = ?info.tier(),
            "Created sender tasks"
        );
        Ok(handle)
    }

    /// Stops one pipeline. In-flight submissions get the shutdown timeout to
    /// finish; unsent fresh items are then persisted with `SHUTDOWN_DRAIN`.
    pub async fn shutdown_pipeline(&self, key: &HandlerKey) -> Result<ShutdownSummary, FactoryError> {
        let running = {
            let mut pipelines = self.pipelines.lock();
            match pipelines.insert(key.clone(), PipelineSlot::ShutDown) {
                Some(PipelineSlot::Running(running)) => running,
                Some(PipelineSlot::ShutDown) => return Err(FactoryError::ShutDown(key.clone())),
                None => {
                    pipelines.remove(key);
                    return Err(FactoryError::NotFound(key.clone()));
                }
            }
        };
        Ok(self.stop(running).await)
    }

    /// Stops every running pipeline.
    pub async fn shutdown(&self) -> ShutdownSummary {
        let running: Vec<_> = {
            let mut pipelines = self.pipelines.lock();
            let keys: Vec<_> = pipelines
                .iter()
                .filter(|(_, slot)| matches!(slot, PipelineSlot::Running(_)))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| match pipelines.insert(key, PipelineSlot::ShutDown) {
                    Some(PipelineSlot::Running(running)) => Some(running),
                    _ => None,
                })
                .collect()
        };

        let mut summary = ShutdownSummary::default();
        for stopped in join_all(running.into_iter().map(|r| self.stop(r))).await {
            summary += stopped;
        }
        info!(
            pipelines = summary.pipelines,
            drained = summary.drained_items,
            dropped = summary.dropped_items,
            abandoned = summary.abandoned_workers,
            "Sender tasks shut down"
        );
        summary
    }

    async fn stop(&self, running: RunningPipeline) -> ShutdownSummary {
        let handle = running.handle;
        handle.inner.cancel.cancel();

        let aborts: Vec<_> = running.workers.iter().map(|w| w.abort_handle()).collect();
        let mut summary = ShutdownSummary {
            pipelines: 1,
            ..Default::default()
        };

        if tokio::time::timeout(self.shutdown_timeout, join_all(running.workers))
            .await
            .is_err()
        {
            for abort in aborts.iter().filter(|a| !a.is_finished()) {
                abort.abort();
                summary.abandoned_workers += 1;
            }
            warn!(
                pipeline = %handle.key(),
                timeout = ?self.shutdown_timeout,
                abandoned = summary.abandoned_workers,
                "Sender tasks did not stop in time"
            );
        }

        let DrainSummary { persisted, dropped } = handle.drain().await;
        summary.drained_items = persisted;
        summary.dropped_items = dropped;

        for shard in 0..handle.buffer().shard_count() {
            if let Ok(queue) = handle.buffer().shard(shard) {
                if let TaskQueue::External(queue) = queue.as_ref() {
                    queue.cancel_retries();
                }
            }
        }

        info!(pipeline = %handle.key(), drained = persisted, dropped, "Pipeline shut down");
        summary
    }

    /// Drops every persisted, unacknowledged task of every running pipeline.
    pub async fn truncate_buffers(&self) -> Result<usize, FactoryError> {
        let mut cleared = 0;
        for handle in self.handles() {
            cleared += handle.buffer().truncate().await?;
        }
        warn!(tasks = cleared, "Truncated all buffers");
        Ok(cleared)
    }

    /// Writes buffered items of one pipeline, or of all when `key` is `None`.
    pub async fn export_buffers<W>(
        &self,
        key: Option<&HandlerKey>,
        sink: &mut W,
        retain: bool,
    ) -> Result<ExportSummary, FactoryError>
    where
        W: AsyncWrite + Unpin,
    {
        let handles = match key {
            Some(key) => vec![self.handle(key).ok_or_else(|| FactoryError::NotFound(key.clone()))?],
            None => self.handles(),
        };

        let mut summary = ExportSummary::default();
        for handle in handles {
            summary += handle.buffer().export(sink, retain).await?;
        }
        Ok(summary)
    }

    pub async fn health(&self, config: &HealthConfig) -> HealthReport {
        let mut pipelines = Vec::new();
        for handle in self.handles() {
            pipelines.push(handle.health().await);
        }
        HealthReport::generate(pipelines, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferError, StorageConfig};
    use crate::domain::{EntityType, QueueingReason, TierKind};
    use crate::properties::QueueingLevel;
    use crate::sender::api::{MockBackendApi, SubmissionOutcome};
    use crate::sender::error::ReportError;

    fn items(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("event {i}")).collect()
    }

    fn factory(backend: MockBackendApi) -> SenderTaskFactory {
        let properties = PropertiesRegistry::new();
        for props in properties.iter() {
            props.set_flush_interval(Duration::from_secs(3600));
        }
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        SenderTaskFactory::new(Arc::new(backend), properties, metrics)
            .with_shutdown_timeout(Duration::from_secs(1))
    }

    async fn memory_pipeline(
        factory: &SenderTaskFactory,
        entity: EntityType,
    ) -> Result<PipelineHandle, FactoryError> {
        let info = QueueInfo::new(HandlerKey::new(entity, "2878"), 1, true, TierKind::Memory).unwrap();
        let buffer = Buffer::open(&info, &StorageConfig::default()).await?;
        factory.create_sender_tasks(&info, buffer)
    }

    #[tokio::test]
    async fn test_lifecycle_is_terminal() {
        let factory = factory(MockBackendApi::new());
        let key = HandlerKey::new(EntityType::Points, "2878");
        assert_eq!(factory.state(&key), PipelineState::Uncreated);

        memory_pipeline(&factory, EntityType::Points).await.unwrap();
        assert_eq!(factory.state(&key), PipelineState::Running);
        assert!(matches!(
            memory_pipeline(&factory, EntityType::Points).await,
            Err(FactoryError::AlreadyCreated(_))
        ));

        let summary = factory.shutdown_pipeline(&key).await.unwrap();
        assert_eq!(summary.pipelines, 1);
        assert_eq!(summary.abandoned_workers, 0);
        assert_eq!(factory.state(&key), PipelineState::ShutDown);
        assert!(matches!(
            factory.shutdown_pipeline(&key).await,
            Err(FactoryError::ShutDown(_))
        ));
        assert!(matches!(
            memory_pipeline(&factory, EntityType::Points).await,
            Err(FactoryError::AlreadyCreated(_))
        ));
    }

    #[tokio::test]
    async fn test_shard_mismatch_is_rejected() {
        let factory = factory(MockBackendApi::new());
        let key = HandlerKey::new(EntityType::Spans, "30001");
        let opened = QueueInfo::new(key.clone(), 2, true, TierKind::Memory).unwrap();
        let expected = QueueInfo::new(key, 4, true, TierKind::Memory).unwrap();
        let buffer = Buffer::open(&opened, &StorageConfig::default()).await.unwrap();

        assert!(matches!(
            factory.create_sender_tasks(&expected, buffer),
            Err(FactoryError::ShardMismatch { expected: 4, actual: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_level_drops_overflow() {
        let factory = factory(MockBackendApi::new());
        let props = factory.properties().get(EntityType::Logs);
        props.set_queueing_level(QueueingLevel::Memory);
        props.set_memory_buffer_limit(10);

        let handle = memory_pipeline(&factory, EntityType::Logs).await.unwrap();
        let outcome = handle.report(None, items(15)).await.unwrap();

        assert_eq!(outcome.accepted, 10);
        assert_eq!(outcome.dropped, 5);
        assert_eq!(outcome.persisted, 0);
        assert_eq!(handle.pending_items(), 10);
        assert_eq!(handle.buffer().size().await.unwrap(), 0);
        assert_eq!(handle.metrics().snapshot().dropped_items, 5);

        // nothing is persisted on shutdown either
        let summary = factory.shutdown().await;
        assert_eq!(summary.dropped_items, 10);
        assert_eq!(handle.buffer().size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_any_error_spools_overflow_to_queue() {
        let factory = factory(MockBackendApi::new());
        let props = factory.properties().get(EntityType::Events);
        props.set_memory_buffer_limit(10);
        props.set_batch_size(4);

        let handle = memory_pipeline(&factory, EntityType::Events).await.unwrap();
        let outcome = handle.report(None, items(20)).await.unwrap();

        assert_eq!(outcome.accepted, 10);
        assert_eq!(outcome.persisted, 10);
        let queue = handle.buffer().shard(0).unwrap();
        let tasks = queue.iterate().await.unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|(_, t)| t.reason() == Some(QueueingReason::BufferFull)));
        assert_eq!(tasks[0].1.items()[0], "event 10");
    }

    #[tokio::test]
    async fn test_shutdown_drains_inbox_to_queue() {
        let factory = factory(MockBackendApi::new());
        let handle = memory_pipeline(&factory, EntityType::Points).await.unwrap();
        handle.report(Some("host-1"), items(7)).await.unwrap();

        let summary = factory.shutdown().await;
        assert_eq!(summary.drained_items, 7);

        let (_, task) = handle.buffer().shard(0).unwrap().peek().await.unwrap().unwrap();
        assert_eq!(task.reason(), Some(QueueingReason::ShutdownDrain));
        assert_eq!(task.len(), 7);
        assert!(matches!(
            handle.report(None, items(1)).await,
            Err(ReportError::ShutDown(_))
        ));
    }

    #[tokio::test]
    async fn test_pushback_blocks_producer_until_space() {
        let factory = factory(MockBackendApi::new());
        let props = factory.properties().get(EntityType::Spans);
        props.set_queueing_level(QueueingLevel::Pushback);
        props.set_memory_buffer_limit(5);

        let handle = memory_pipeline(&factory, EntityType::Spans).await.unwrap();
        handle.report(None, items(5)).await.unwrap();

        let producer = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.report(None, items(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        // the producer gives up once the pipeline shuts down
        factory.shutdown().await;
        let result = producer.await.unwrap();
        assert!(matches!(result, Err(ReportError::ShutDown(_))));
    }

    #[tokio::test]
    async fn test_drain_counts_only_unstored_items_as_dropped() {
        let factory = factory(MockBackendApi::new());
        factory.properties().get(EntityType::Points).set_batch_size(3);
        let info = QueueInfo::new(HandlerKey::new(EntityType::Points, "2878"), 1, true, TierKind::Memory).unwrap();
        let storage = StorageConfig {
            memory_capacity: 2,
            ..Default::default()
        };
        let buffer = Buffer::open(&info, &storage).await.unwrap();
        let handle = factory.create_sender_tasks(&info, buffer).unwrap();
        handle.report(None, items(9)).await.unwrap();

        // two of three batches fit the queue
        let summary = factory.shutdown().await;
        assert_eq!(summary.drained_items, 6);
        assert_eq!(summary.dropped_items, 3);
        assert_eq!(handle.buffer().size().await.unwrap(), 2);
        assert_eq!(handle.metrics().snapshot().dropped_items, 3);
    }

    #[tokio::test]
    async fn test_halted_shard_refuses_reports() {
        let factory = factory(MockBackendApi::new());
        let handle = memory_pipeline(&factory, EntityType::Points).await.unwrap();
        handle.inner.shards[0].halt("disk gone".to_string());

        let result = handle.report(None, items(3)).await;
        assert!(matches!(
            result,
            Err(ReportError::Buffer(BufferError::Halted { shard: 0, ref reason })) if reason == "disk gone"
        ));
        assert_eq!(handle.pending_items(), 0);
        factory.shutdown().await;
    }

    #[tokio::test]
    async fn test_halt_releases_blocked_producer() {
        let factory = factory(MockBackendApi::new());
        let props = factory.properties().get(EntityType::Spans);
        props.set_queueing_level(QueueingLevel::Pushback);
        props.set_memory_buffer_limit(5);

        let handle = memory_pipeline(&factory, EntityType::Spans).await.unwrap();
        handle.report(None, items(5)).await.unwrap();
        let producer = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.report(None, items(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        handle.inner.shards[0].halt("disk gone".to_string());
        let result = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ReportError::Buffer(BufferError::Halted { .. }))));
        factory.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_delivers_on_flush_interval() {
        let mut backend = MockBackendApi::new();
        backend
            .expect_submit()
            .times(1)
            .withf(|_, items| items.len() == 3)
            .returning(|_, _| SubmissionOutcome::Delivered);
        let factory = factory(backend);
        let props = factory.properties().get(EntityType::Histograms);
        props.set_flush_interval(Duration::from_millis(10));

        let handle = memory_pipeline(&factory, EntityType::Histograms).await.unwrap();
        handle.report(None, items(3)).await.unwrap();

        for _ in 0..100 {
            if handle.metrics().snapshot().delivered_items == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.metrics().snapshot().delivered_items, 3);
        assert_eq!(handle.pending_items(), 0);

        let report = factory.health(&HealthConfig::default()).await;
        assert_eq!(report.pipelines.len(), 1);
        assert_eq!(report.pipelines[0].total_tasks(), 0);
        factory.shutdown().await;
    }

    #[test]
    fn test_buffer_error_converts() {
        let err: FactoryError = BufferError::QueueFull { capacity: 1 }.into();
        assert!(matches!(err, FactoryError::Buffer(_)));
    }
}
