use super::error::ReportError;
use super::task::{SenderContext, ShardState};
use crate::buffer::{Buffer, BufferError, Inbox};
use crate::domain::{DataSubmissionTask, HandlerKey, Item, QueueingReason};
use crate::properties::{FailureAction, FailureKind, QueueingLevel, decide};
use crate::reliability::{BacklogHealth, PipelineMetrics, ShardHealth};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Where the items of one `report` call ended up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportOutcome {
    /// Taken into the shard's in-memory inbox.
    pub accepted: usize,
    /// Written straight to the task queue because the inbox was full.
    pub persisted: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
    pub persisted: usize,
    pub dropped: usize,
}

#[derive(Debug)]
pub(crate) struct PipelineShared {
    pub(crate) ctx: SenderContext,
    pub(crate) buffer: Arc<Buffer>,
    pub(crate) inboxes: Vec<Arc<Inbox>>,
    pub(crate) shards: Vec<Arc<ShardState>>,
    pub(crate) cancel: CancellationToken,
}

/// Decoder-facing entry point of one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    pub(crate) inner: Arc<PipelineShared>,
}

impl PipelineHandle {
    pub fn key(&self) -> &HandlerKey {
        &self.inner.ctx.key
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.inner.buffer
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.inner.ctx.metrics
    }

    pub fn shard_count(&self) -> usize {
        self.inner.inboxes.len()
    }

    /// Fresh items waiting in memory over all shards.
    pub fn pending_items(&self) -> usize {
        self.inner.inboxes.iter().map(|inbox| inbox.len()).sum()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Hands decoded items to the pipeline.
    ///
    /// Items go to the in-memory inbox of the routed shard. When it is full
    /// the queueing level decides: `PUSHBACK` waits for space, `ANY_ERROR`
    /// spools the rest to the task queue and `MEMORY` drops it. A halted
    /// shard refuses new items.
    pub async fn report(
        &self,
        ordering_key: Option<&str>,
        items: Vec<Item>,
    ) -> Result<ReportOutcome, ReportError> {
        let mut outcome = ReportOutcome::default();
        if items.is_empty() {
            return Ok(outcome);
        }
        if self.is_shut_down() {
            return Err(ReportError::ShutDown(self.key().clone()));
        }

        let ctx = &self.inner.ctx;
        ctx.limiter.record_received(items.len());

        let shard = self.inner.buffer.route(ordering_key);
        let (inbox, state) = self
            .inner
            .inboxes
            .get(shard)
            .zip(self.inner.shards.get(shard))
            .ok_or(BufferError::ShardOutOfRange {
                shard,
                shards: self.inner.inboxes.len(),
            })?;

        let mut pending = items;
        loop {
            let halt = state.halt_signal();
            if let Some(reason) = state.halted() {
                return Err(BufferError::Halted { shard, reason }.into());
            }
            let space = inbox.space_available();
            let offered = pending.len();
            let rest = inbox.push_within(pending, ctx.props.memory_buffer_limit());
            outcome.accepted += offered - rest.len();
            if rest.is_empty() {
                return Ok(outcome);
            }

            let level = ctx.props.queueing_level();
            match decide(level, FailureKind::Overflow, ctx.props.split_on_rate_limit()) {
                FailureAction::Block => {
                    debug!(pipeline = %ctx.key, shard, waiting = rest.len(), "Inbox full, waiting");
                    tokio::select! {
                        biased;
                        _ = self.inner.cancel.cancelled() => {
                            return Err(ReportError::ShutDown(ctx.key.clone()));
                        }
                        _ = space => {}
                        _ = halt => {}
                    }
                    pending = rest;
                }
                FailureAction::Persist(reason) => {
                    let result = self.spool(shard, rest, reason, true, &mut outcome.persisted).await;
                    return result.map(|()| outcome);
                }
                _ => {
                    warn!(
                        pipeline = %ctx.key,
                        shard,
                        items = rest.len(),
                        limit = ctx.props.memory_buffer_limit(),
                        "Memory buffer full, dropping items"
                    );
                    ctx.sampler
                        .record_all(ctx.key.handle(), rest.iter(), "memory buffer full");
                    ctx.metrics.record_dropped(rest.len());
                    outcome.dropped += rest.len();
                    return Ok(outcome);
                }
            }
        }
    }

    /// Splits `items` into batch-sized tasks on the queue of `shard`, adding
    /// each stored task's items to `persisted`. With `wait` false a full
    /// memory tier fails instead of blocking.
    async fn spool(
        &self,
        shard: usize,
        items: Vec<Item>,
        reason: QueueingReason,
        wait: bool,
        persisted: &mut usize,
    ) -> Result<(), ReportError> {
        let ctx = &self.inner.ctx;
        let queue = self.inner.buffer.shard(shard)?;
        let batch_size = ctx.props.batch_size().max(1);
        let total = items.len();

        let mut items = items;
        while !items.is_empty() {
            let rest = items.split_off(batch_size.min(items.len()));
            let task = DataSubmissionTask::new(&ctx.key, items)?.queued(reason);
            let len = task.len();
            if wait {
                queue.append(task).await?;
            } else {
                queue.try_append(task).await?;
            }
            ctx.metrics.record_queued(len);
            *persisted += len;
            items = rest;
        }

        debug!(pipeline = %ctx.key, shard, items = total, %reason, "Spooled items to task queue");
        Ok(())
    }

    /// Moves unsent fresh items of every shard to the task queue, or drops
    /// them under the `MEMORY` level.
    pub(crate) async fn drain(&self) -> DrainSummary {
        let ctx = &self.inner.ctx;
        let mut summary = DrainSummary::default();

        for (shard, (inbox, state)) in self.inner.inboxes.iter().zip(&self.inner.shards).enumerate() {
            let mut items = state
                .take_in_flight()
                .map(DataSubmissionTask::into_items)
                .unwrap_or_default();
            items.extend(inbox.drain());
            if items.is_empty() {
                continue;
            }

            if ctx.props.queueing_level() == QueueingLevel::Memory {
                warn!(pipeline = %ctx.key, shard, items = items.len(), "Dropping unsent items on shutdown");
                ctx.metrics.record_dropped(items.len());
                summary.dropped += items.len();
                continue;
            }

            let count = items.len();
            let mut persisted = 0;
            let result = self
                .spool(shard, items, QueueingReason::ShutdownDrain, false, &mut persisted)
                .await;
            summary.persisted += persisted;
            if let Err(e) = result {
                let lost = count - persisted;
                error!(pipeline = %ctx.key, shard, items = lost, persisted, error = %e, "Failed to persist unsent items");
                ctx.metrics.record_dropped(lost);
                summary.dropped += lost;
            }
        }
        summary
    }

    /// Backlog size and age per shard.
    pub async fn health(&self) -> BacklogHealth {
        let now = Utc::now();
        let mut shards = Vec::with_capacity(self.shard_count());

        for (shard, state) in self.inner.shards.iter().enumerate() {
            let stats = match self.inner.buffer.shard(shard) {
                Ok(queue) => queue.stats().await,
                Err(e) => Err(e),
            };
            let health = match stats {
                Ok(stats) => ShardHealth {
                    shard,
                    tasks: stats.tasks,
                    items: stats.items,
                    oldest_age: stats
                        .oldest
                        .map(|oldest| (now - oldest).to_std().unwrap_or_default()),
                    halted: state.halted(),
                },
                Err(e) => ShardHealth {
                    shard,
                    tasks: 0,
                    items: 0,
                    oldest_age: None,
                    halted: Some(state.halted().unwrap_or_else(|| e.to_string())),
                },
            };
            shards.push(health);
        }

        BacklogHealth {
            key: self.key().clone(),
            shards,
        }
    }
}
