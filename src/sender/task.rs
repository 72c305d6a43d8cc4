use super::api::{BackendApi, SubmissionOutcome};
use crate::buffer::{BufferError, Inbox, TaskHandle, TaskQueue};
use crate::domain::{DataSubmissionTask, HandlerKey, QueueingReason};
use crate::properties::{EntityProperties, FailureAction, FailureKind, QueueingLevel, decide};
use crate::reliability::{Backoff, BlockedSampler, PipelineMetrics, RateLimiter};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every sender of one pipeline.
#[derive(Clone)]
pub struct SenderContext {
    pub key: HandlerKey,
    pub props: Arc<EntityProperties>,
    pub limiter: Arc<RateLimiter>,
    pub sampler: Arc<BlockedSampler>,
    pub metrics: Arc<PipelineMetrics>,
    pub backend: Arc<dyn BackendApi>,
}

impl fmt::Debug for SenderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderContext")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Parts of a shard's state that outlive its worker.
#[derive(Debug, Default)]
pub struct ShardState {
    halted: Mutex<Option<String>>,
    halt_signal: Notify,
    in_flight: Mutex<Option<DataSubmissionTask>>,
}

impl ShardState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reason the shard stopped, set after a fatal storage error.
    pub fn halted(&self) -> Option<String> {
        self.halted.lock().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.lock().is_some()
    }

    pub(crate) fn halt(&self, reason: String) {
        self.halted.lock().get_or_insert(reason);
        self.halt_signal.notify_waiters();
    }

    /// Resolves on the next halt. Create it before checking `halted` so a
    /// concurrent halt is not missed.
    pub fn halt_signal(&self) -> Notified<'_> {
        self.halt_signal.notified()
    }

    /// Fresh batch taken from the inbox whose outcome is not settled yet.
    pub fn take_in_flight(&self) -> Option<DataSubmissionTask> {
        self.in_flight.lock().take()
    }

    fn set_in_flight(&self, task: DataSubmissionTask) {
        *self.in_flight.lock() = Some(task);
    }

    fn clear_in_flight(&self) {
        self.in_flight.lock().take();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSource {
    Backlog(TaskHandle),
    Fresh,
}

/// What one sender cycle did. Item counts, not task counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub source: Option<BatchSource>,
    pub submissions: usize,
    pub delivered: usize,
    pub rejected: usize,
    pub persisted: usize,
    pub dropped: usize,
    pub deferred: bool,
    pub halted: bool,
    pub backoff: Option<Duration>,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.source.is_none() && !self.deferred && !self.halted
    }

    /// The cycle delivered without hitting any limit, so the next one can
    /// start right away.
    fn should_continue(&self) -> bool {
        self.delivered > 0 && self.backoff.is_none() && !self.deferred && !self.halted
    }
}

/// Worker of one shard: drains the backlog first, then fresh items, and
/// applies the failure policy to every batch the backend does not accept.
pub struct SenderTask {
    ctx: SenderContext,
    shard: usize,
    queue: Arc<TaskQueue>,
    inbox: Arc<Inbox>,
    state: Arc<ShardState>,
    cancel: CancellationToken,
    backoff_until: Option<Instant>,
}

impl fmt::Debug for SenderTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderTask")
            .field("key", &self.ctx.key)
            .field("shard", &self.shard)
            .field("backoff_until", &self.backoff_until)
            .finish_non_exhaustive()
    }
}

impl SenderTask {
    pub fn new(
        ctx: SenderContext,
        shard: usize,
        queue: Arc<TaskQueue>,
        inbox: Arc<Inbox>,
        state: Arc<ShardState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            shard,
            queue,
            inbox,
            state,
            cancel,
            backoff_until: None,
        }
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn backoff_until(&self) -> Option<Instant> {
        self.backoff_until
    }

    /// Runs cycles on the flush interval until cancelled or halted.
    pub async fn run(mut self) {
        info!(pipeline = %self.ctx.key, shard = self.shard, "Sender task started");

        'outer: loop {
            let interval = self.ctx.props.flush_interval();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            loop {
                let report = self.run_cycle_at(Instant::now()).await;
                if report.halted {
                    error!(
                        pipeline = %self.ctx.key,
                        shard = self.shard,
                        reason = %self.state.halted().unwrap_or_default(),
                        "Sender task halted"
                    );
                    break 'outer;
                }
                if self.cancel.is_cancelled() || !report.should_continue() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }

        info!(pipeline = %self.ctx.key, shard = self.shard, "Sender task stopped");
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        self.run_cycle_at(Instant::now()).await
    }

    /// One delivery attempt as of `now`.
    pub async fn run_cycle_at(&mut self, now: Instant) -> CycleReport {
        let mut report = CycleReport::default();
        if self.state.is_halted() {
            report.halted = true;
            return report;
        }
        if let Some(until) = self.backoff_until {
            if now < until {
                report.deferred = true;
                return report;
            }
            self.backoff_until = None;
        }

        let result = match self.queue.peek().await {
            Ok(Some((handle, task))) => self.send_backlog(handle, task, now, &mut report).await,
            Ok(None) => self.send_fresh(now, &mut report).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            self.storage_failed(e, now, &mut report);
        }
        report
    }

    async fn send_backlog(
        &mut self,
        handle: TaskHandle,
        task: DataSubmissionTask,
        now: Instant,
        report: &mut CycleReport,
    ) -> Result<(), BufferError> {
        report.source = Some(BatchSource::Backlog(handle));

        if !self.ctx.limiter.try_acquire_at(task.len(), now) {
            self.ctx.metrics.record_rate_limited();
            let admitted = match self.ctx.props.queueing_level() {
                QueueingLevel::Pushback => self.ctx.limiter.acquire(task.len(), &self.cancel).await,
                QueueingLevel::Memory | QueueingLevel::AnyError => {
                    let wait = self.ctx.limiter.time_until_available(task.len(), now);
                    self.back_off(now, wait, report);
                    false
                }
            };
            if !admitted {
                report.deferred = true;
                return Ok(());
            }
        }

        debug!(
            pipeline = %self.ctx.key,
            shard = self.shard,
            task = %handle,
            items = task.len(),
            attempts = task.attempts(),
            "Resubmitting backlog task"
        );
        let failed = self.submit_all(task, report).await;
        let delay = self.retry_delay(&failed);

        let mut failed = failed.into_iter();
        match failed.next() {
            None => self.queue.remove(handle).await?,
            Some(first) => {
                let len = first.len();
                if self.queue.requeue(handle, first).await? {
                    self.ctx.metrics.record_retry();
                    report.persisted += len;
                } else {
                    debug!(task = %handle, "Backlog task vanished before requeue");
                }
                let rest: Vec<_> = failed.collect();
                if !rest.is_empty() {
                    self.persist(rest, report).await?;
                }
            }
        }

        if let Some(delay) = delay {
            self.back_off(now, delay, report);
        }
        Ok(())
    }

    async fn send_fresh(&mut self, now: Instant, report: &mut CycleReport) -> Result<(), BufferError> {
        let mut n = self.inbox.len().min(self.ctx.props.batch_size());
        if let Some(max) = self.ctx.limiter.max_permits() {
            n = n.min(max);
        }
        if n == 0 {
            return Ok(());
        }
        report.source = Some(BatchSource::Fresh);

        if !self.ctx.limiter.try_acquire_at(n, now) {
            self.ctx.metrics.record_rate_limited();
            let wait = self.ctx.limiter.time_until_available(n, now);
            let level = self.ctx.props.queueing_level();
            let split = self.ctx.props.split_on_rate_limit();

            match decide(level, FailureKind::LocalRateLimited, split) {
                FailureAction::Block => {
                    if !self.ctx.limiter.acquire(n, &self.cancel).await {
                        report.deferred = true;
                        return Ok(());
                    }
                }
                FailureAction::Persist(reason) => {
                    let items = self.inbox.take(n);
                    if !items.is_empty() {
                        let task = DataSubmissionTask::new(&self.ctx.key, items)?.queued(reason);
                        self.persist(vec![task], report).await?;
                    }
                    self.back_off(now, wait, report);
                    return Ok(());
                }
                _ => {
                    self.back_off(now, wait, report);
                    report.deferred = true;
                    return Ok(());
                }
            }
        }

        let items = self.inbox.take(n);
        if items.is_empty() {
            report.source = None;
            return Ok(());
        }
        let task = DataSubmissionTask::new(&self.ctx.key, items)?;
        self.state.set_in_flight(task.clone());

        let failed = self.submit_all(task, report).await;
        let delay = self.retry_delay(&failed);
        self.persist(failed, report).await?;
        self.state.clear_in_flight();

        if let Some(delay) = delay {
            self.back_off(now, delay, report);
        }
        Ok(())
    }

    /// Submits `task`, resubmitting what remains after rejections and splits.
    /// Returns the pieces that must be persisted, already marked as retried.
    async fn submit_all(
        &self,
        task: DataSubmissionTask,
        report: &mut CycleReport,
    ) -> Vec<DataSubmissionTask> {
        let level = self.ctx.props.queueing_level();
        let split = self.ctx.props.split_on_rate_limit();
        let mut pending = vec![task];
        let mut failed = Vec::new();

        while let Some(task) = pending.pop() {
            report.submissions += 1;
            match self.ctx.backend.submit(&self.ctx.key, task.items()).await {
                SubmissionOutcome::Delivered => {
                    report.delivered += task.len();
                    self.ctx.metrics.record_delivered(task.len());
                }
                SubmissionOutcome::Rejected { indices, message } => {
                    match offending_items(&task, indices.as_deref()) {
                        Some(rejected) => {
                            if let Some(remainder) =
                                self.drop_rejected(&task, &rejected, &message, report)
                            {
                                pending.push(remainder);
                            }
                        }
                        None => {
                            self.ctx.metrics.record_failed_submission();
                            warn!(
                                pipeline = %self.ctx.key,
                                shard = self.shard,
                                items = task.len(),
                                indices = ?indices,
                                "Backend rejection names no item of the batch"
                            );
                            let action = decide(level, FailureKind::Unavailable, split);
                            self.fail(task, action, &mut failed, report);
                        }
                    }
                }
                SubmissionOutcome::RateLimited => {
                    self.ctx.metrics.record_rate_limited();
                    match decide(level, FailureKind::BackendRateLimited, split) {
                        FailureAction::SplitAndRetry => match task.split() {
                            Some((head, tail)) => {
                                self.ctx.metrics.record_split();
                                debug!(
                                    pipeline = %self.ctx.key,
                                    shard = self.shard,
                                    head = head.len(),
                                    tail = tail.len(),
                                    "Splitting rate-limited batch"
                                );
                                pending.push(tail);
                                pending.push(head);
                            }
                            None => {
                                let action = decide(level, FailureKind::BackendRateLimited, false);
                                self.fail(task, action, &mut failed, report);
                            }
                        },
                        action => self.fail(task, action, &mut failed, report),
                    }
                }
                SubmissionOutcome::Unavailable(reason) => {
                    self.ctx.metrics.record_failed_submission();
                    debug!(
                        pipeline = %self.ctx.key,
                        shard = self.shard,
                        items = task.len(),
                        reason = %reason,
                        "Backend unavailable"
                    );
                    let action = decide(level, FailureKind::Unavailable, split);
                    self.fail(task, action, &mut failed, report);
                }
            }
        }

        failed
    }

    /// Samples and drops the rejected items; returns the rest, if any.
    fn drop_rejected(
        &self,
        task: &DataSubmissionTask,
        rejected: &HashSet<usize>,
        message: &str,
        report: &mut CycleReport,
    ) -> Option<DataSubmissionTask> {
        let (blocked, remainder): (Vec<_>, Vec<_>) = task
            .items()
            .iter()
            .enumerate()
            .partition(|(i, _)| rejected.contains(i));

        let reason = if message.is_empty() {
            QueueingReason::BackendRejected.as_str()
        } else {
            message
        };
        self.ctx
            .sampler
            .record_all(task.handle(), blocked.iter().map(|(_, item)| *item), reason);
        self.ctx.metrics.record_blocked(blocked.len());
        report.rejected += blocked.len();

        warn!(
            pipeline = %self.ctx.key,
            shard = self.shard,
            rejected = blocked.len(),
            remaining = remainder.len(),
            "Backend rejected items"
        );

        if remainder.is_empty() {
            return None;
        }
        let remainder: Vec<_> = remainder.into_iter().map(|(_, item)| item.clone()).collect();
        task.with_items(remainder).ok()
    }

    fn fail(
        &self,
        task: DataSubmissionTask,
        action: FailureAction,
        failed: &mut Vec<DataSubmissionTask>,
        report: &mut CycleReport,
    ) {
        match action {
            FailureAction::Drop => self.drop_task(&task, "delivery failed", report),
            FailureAction::Persist(reason) => failed.push(task.retried(reason)),
            _ => failed.push(task.retried(QueueingReason::SubmissionError)),
        }
    }

    fn drop_task(&self, task: &DataSubmissionTask, cause: &str, report: &mut CycleReport) {
        warn!(
            pipeline = %self.ctx.key,
            shard = self.shard,
            items = task.len(),
            cause,
            "Dropping batch"
        );
        self.ctx.sampler.record_all(task.handle(), task.items(), cause);
        self.ctx.metrics.record_dropped(task.len());
        report.dropped += task.len();
    }

    /// Appends without blocking on this shard's own queue; a full memory
    /// tier drops the task.
    async fn persist(
        &self,
        tasks: Vec<DataSubmissionTask>,
        report: &mut CycleReport,
    ) -> Result<(), BufferError> {
        for task in tasks {
            let len = task.len();
            let attempts = task.attempts();
            match self.queue.try_append(task).await {
                Ok(()) => {
                    self.ctx.metrics.record_queued(len);
                    if attempts > 0 {
                        self.ctx.metrics.record_retry();
                    }
                    report.persisted += len;
                }
                Err(BufferError::QueueFull { capacity }) => {
                    warn!(
                        pipeline = %self.ctx.key,
                        shard = self.shard,
                        items = len,
                        capacity,
                        "Task queue full, dropping batch"
                    );
                    self.ctx.metrics.record_dropped(len);
                    report.dropped += len;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn retry_delay(&self, failed: &[DataSubmissionTask]) -> Option<Duration> {
        let attempts = failed.iter().map(|t| t.attempts()).max()?;
        Some(Backoff::from_properties(&self.ctx.props).delay_for(attempts))
    }

    fn back_off(&mut self, now: Instant, delay: Duration, report: &mut CycleReport) {
        let delay = report.backoff.map_or(delay, |current| current.max(delay));
        self.backoff_until = Some(now + delay);
        report.backoff = Some(delay);
        debug!(pipeline = %self.ctx.key, shard = self.shard, ?delay, "Backing off");
    }

    fn storage_failed(&mut self, e: BufferError, now: Instant, report: &mut CycleReport) {
        if e.is_fatal() {
            error!(
                pipeline = %self.ctx.key,
                shard = self.shard,
                error = %e,
                "Fatal storage error, halting shard"
            );
            self.state.halt(e.to_string());
            report.halted = true;
        } else {
            warn!(
                pipeline = %self.ctx.key,
                shard = self.shard,
                error = %e,
                "Storage error, retrying later"
            );
            let delay = Backoff::from_properties(&self.ctx.props).delay_for(1);
            self.back_off(now, delay, report);
        }
    }
}

/// Positions of `task` a rejection refers to. `None` indices refuse the
/// whole payload; a list naming no position of the batch yields `None`.
fn offending_items(task: &DataSubmissionTask, indices: Option<&[usize]>) -> Option<HashSet<usize>> {
    match indices {
        None => Some((0..task.len()).collect()),
        Some(list) => {
            let rejected: HashSet<usize> =
                list.iter().copied().filter(|&i| i < task.len()).collect();
            (!rejected.is_empty()).then_some(rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{CloudMessage, CloudQueueClient, ExternalQueueConfig, ExternalQueueError};
    use crate::buffer::{ExternalTaskQueue, MemoryTaskQueue, OverflowPolicy};
    use crate::domain::EntityType;
    use crate::sender::api::MockBackendApi;
    use async_trait::async_trait;
    use mockall::Sequence;

    struct Fixture {
        sender: SenderTask,
        queue: Arc<TaskQueue>,
        inbox: Arc<Inbox>,
        props: Arc<EntityProperties>,
        sampler: Arc<BlockedSampler>,
    }

    fn items(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("cpu.load {i} source=web-{i}")).collect()
    }

    fn fixture_with_queue(entity: EntityType, backend: MockBackendApi, queue: TaskQueue) -> Fixture {
        let props = Arc::new(EntityProperties::new(entity));
        let sampler = Arc::new(BlockedSampler::new(Arc::clone(&props)));
        let ctx = SenderContext {
            key: HandlerKey::new(entity, "2878"),
            props: Arc::clone(&props),
            limiter: Arc::new(RateLimiter::new(Arc::clone(&props))),
            sampler: Arc::clone(&sampler),
            metrics: Arc::new(PipelineMetrics::new()),
            backend: Arc::new(backend),
        };
        let queue = Arc::new(queue);
        let inbox = Arc::new(Inbox::new());
        let sender = SenderTask::new(
            ctx,
            0,
            Arc::clone(&queue),
            Arc::clone(&inbox),
            Arc::new(ShardState::new()),
            CancellationToken::new(),
        );
        Fixture {
            sender,
            queue,
            inbox,
            props,
            sampler,
        }
    }

    fn fixture(entity: EntityType, backend: MockBackendApi) -> Fixture {
        let queue = TaskQueue::Memory(MemoryTaskQueue::new(100, OverflowPolicy::DropNewest));
        fixture_with_queue(entity, backend, queue)
    }

    #[tokio::test]
    async fn test_transient_failures_back_off_then_ack() {
        let mut backend = MockBackendApi::new();
        let mut seq = Sequence::new();
        backend
            .expect_submit()
            .times(3)
            .in_sequence(&mut seq)
            .withf(|_, items| items.len() == 100)
            .returning(|_, _| SubmissionOutcome::Unavailable("HTTP 503".to_string()));
        backend
            .expect_submit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| SubmissionOutcome::Delivered);

        let mut f = fixture(EntityType::Points, backend);
        f.inbox.push_within(items(100), 1_000);
        let start = Instant::now();

        let first = f.sender.run_cycle_at(start).await;
        assert_eq!(first.source, Some(BatchSource::Fresh));
        assert_eq!(first.persisted, 100);
        assert_eq!(first.backoff, Some(Duration::from_secs(2)));

        let early = f.sender.run_cycle_at(start + Duration::from_secs(1)).await;
        assert!(early.deferred);
        assert_eq!(early.submissions, 0);

        let second = f.sender.run_cycle_at(start + Duration::from_secs(2)).await;
        assert!(matches!(second.source, Some(BatchSource::Backlog(_))));
        assert_eq!(second.backoff, Some(Duration::from_secs(4)));

        let third = f.sender.run_cycle_at(start + Duration::from_secs(6)).await;
        assert_eq!(third.backoff, Some(Duration::from_secs(8)));
        let (_, pending) = f.queue.peek().await.unwrap().unwrap();
        assert_eq!(pending.attempts(), 3);
        assert_eq!(pending.reason(), Some(QueueingReason::SubmissionError));

        let last = f.sender.run_cycle_at(start + Duration::from_secs(14)).await;
        assert_eq!(last.delivered, 100);
        assert_eq!(last.backoff, None);
        assert_eq!(f.queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejected_items_are_sampled_and_rest_resubmitted() {
        let mut backend = MockBackendApi::new();
        let mut seq = Sequence::new();
        backend
            .expect_submit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| SubmissionOutcome::Rejected {
                indices: Some(vec![3, 10, 20]),
                message: "invalid metric name".to_string(),
            });
        backend
            .expect_submit()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, items| items.len() == 47 && !items.iter().any(|i| i.starts_with("cpu.load 10 ")))
            .returning(|_, _| SubmissionOutcome::Delivered);

        let mut f = fixture(EntityType::Points, backend);
        f.inbox.push_within(items(50), 1_000);

        let report = f.sender.run_cycle_at(Instant::now()).await;
        assert_eq!(report.rejected, 3);
        assert_eq!(report.delivered, 47);
        assert_eq!(report.persisted, 0);
        assert_eq!(f.sampler.total_blocked(), 3);
        assert_eq!(f.sampler.recent_samples().len(), 3);
    }

    #[tokio::test]
    async fn test_rejection_outside_batch_never_drops_valid_items() {
        let mut backend = MockBackendApi::new();
        backend
            .expect_submit()
            .times(1)
            .returning(|_, _| SubmissionOutcome::Rejected {
                indices: Some(vec![99]),
                message: "unknown".to_string(),
            });

        let mut f = fixture(EntityType::Points, backend);
        f.inbox.push_within(items(10), 1_000);

        let report = f.sender.run_cycle_at(Instant::now()).await;
        assert_eq!(report.rejected, 0);
        assert_eq!(report.dropped, 0);
        assert_eq!(report.persisted, 10);
        assert!(report.backoff.is_some());
        assert_eq!(f.sampler.total_blocked(), 0);
        let (_, task) = f.queue.peek().await.unwrap().unwrap();
        assert_eq!(task.items(), items(10).as_slice());
        assert_eq!(task.reason(), Some(QueueingReason::SubmissionError));
    }

    #[tokio::test]
    async fn test_whole_payload_rejection_drops_batch() {
        let mut backend = MockBackendApi::new();
        backend
            .expect_submit()
            .times(1)
            .returning(|_, _| SubmissionOutcome::Rejected {
                indices: None,
                message: "malformed payload".to_string(),
            });

        let mut f = fixture(EntityType::Points, backend);
        f.inbox.push_within(items(10), 1_000);

        let report = f.sender.run_cycle_at(Instant::now()).await;
        assert_eq!(report.rejected, 10);
        assert_eq!(report.persisted, 0);
        assert_eq!(f.sampler.total_blocked(), 10);
        assert_eq!(f.queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_split_on_backend_rate_limit() {
        let mut backend = MockBackendApi::new();
        let mut seq = Sequence::new();
        backend
            .expect_submit()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, items| items.len() == 40)
            .returning(|_, _| SubmissionOutcome::RateLimited);
        backend
            .expect_submit()
            .times(2)
            .in_sequence(&mut seq)
            .withf(|_, items| items.len() == 20)
            .returning(|_, _| SubmissionOutcome::Delivered);

        let mut f = fixture(EntityType::Points, backend);
        f.props.set_split_on_rate_limit(true);
        f.inbox.push_within(items(40), 1_000);

        let report = f.sender.run_cycle_at(Instant::now()).await;
        assert_eq!(report.submissions, 3);
        assert_eq!(report.delivered, 40);
        assert_eq!(report.backoff, None);
    }

    #[tokio::test]
    async fn test_rate_limited_without_split_persists() {
        let mut backend = MockBackendApi::new();
        backend
            .expect_submit()
            .times(1)
            .returning(|_, _| SubmissionOutcome::RateLimited);

        let mut f = fixture(EntityType::Points, backend);
        f.inbox.push_within(items(10), 1_000);

        let report = f.sender.run_cycle_at(Instant::now()).await;
        assert_eq!(report.persisted, 10);
        let (_, task) = f.queue.peek().await.unwrap().unwrap();
        assert_eq!(task.reason(), Some(QueueingReason::RateLimited));
        assert_eq!(task.attempts(), 1);
    }

    #[tokio::test]
    async fn test_memory_level_drops_failed_batches() {
        let mut backend = MockBackendApi::new();
        backend
            .expect_submit()
            .times(1)
            .returning(|_, _| SubmissionOutcome::Unavailable("connection refused".to_string()));

        let mut f = fixture(EntityType::Points, backend);
        f.props.set_queueing_level(QueueingLevel::Memory);
        f.inbox.push_within(items(10), 1_000);

        let report = f.sender.run_cycle_at(Instant::now()).await;
        assert_eq!(report.dropped, 10);
        assert_eq!(report.persisted, 0);
        assert_eq!(f.queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_local_rate_limit_persists_under_any_error() {
        let mut backend = MockBackendApi::new();
        backend
            .expect_submit()
            .times(1)
            .withf(|_, items| items.len() == 50)
            .returning(|_, _| SubmissionOutcome::Delivered);

        // events: 5 items/s with a 10 s burst
        let mut f = fixture(EntityType::Events, backend);
        f.inbox.push_within(items(200), 1_000);
        let now = Instant::now();

        let first = f.sender.run_cycle_at(now).await;
        assert_eq!(first.delivered, 50);

        let second = f.sender.run_cycle_at(now).await;
        assert_eq!(second.submissions, 0);
        assert_eq!(second.persisted, 50);
        assert!(second.backoff.is_some());
        let (_, task) = f.queue.peek().await.unwrap().unwrap();
        assert_eq!(task.reason(), Some(QueueingReason::RateLimited));
        assert_eq!(task.attempts(), 0);
        assert_eq!(f.inbox.len(), 100);
    }

    #[tokio::test]
    async fn test_idle_cycle_does_not_submit() {
        let mut backend = MockBackendApi::new();
        backend.expect_submit().never();

        let mut f = fixture(EntityType::Points, backend);
        let report = f.sender.run_cycle_at(Instant::now()).await;
        assert!(report.is_idle());
    }

    #[derive(Debug)]
    struct MissingQueue;

    #[async_trait]
    impl CloudQueueClient for MissingQueue {
        async fn enqueue(&self, queue: &str, _body: &[u8]) -> Result<String, ExternalQueueError> {
            Err(ExternalQueueError::QueueNotFound(queue.to_string()))
        }

        async fn receive(
            &self,
            queue: &str,
            _max_messages: usize,
            _visibility_timeout: Duration,
        ) -> Result<Vec<CloudMessage>, ExternalQueueError> {
            Err(ExternalQueueError::QueueNotFound(queue.to_string()))
        }

        async fn delete(&self, queue: &str, _receipt: &str) -> Result<(), ExternalQueueError> {
            Err(ExternalQueueError::QueueNotFound(queue.to_string()))
        }

        async fn purge(&self, queue: &str) -> Result<usize, ExternalQueueError> {
            Err(ExternalQueueError::QueueNotFound(queue.to_string()))
        }

        async fn approximate_size(&self, queue: &str) -> Result<usize, ExternalQueueError> {
            Err(ExternalQueueError::QueueNotFound(queue.to_string()))
        }
    }

    #[tokio::test]
    async fn test_fatal_storage_error_halts_shard() {
        let mut backend = MockBackendApi::new();
        backend.expect_submit().never();

        let config = ExternalQueueConfig::new(Arc::new(MissingQueue), "proxy-1");
        let queue = TaskQueue::External(ExternalTaskQueue::new("missing", &config));
        let mut f = fixture_with_queue(EntityType::Points, backend, queue);
        let state = Arc::clone(&f.sender.state);

        let report = f.sender.run_cycle_at(Instant::now()).await;
        assert!(report.halted);
        assert!(state.halted().unwrap().contains("missing"));

        let again = f.sender.run_cycle_at(Instant::now()).await;
        assert!(again.halted);
    }
}
