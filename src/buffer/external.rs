//! External-queue tier: task queues backed by a managed remote queue service.

use super::queue::{QueueStats, TaskHandle};
use crate::domain::{DataSubmissionTask, EntityType};
use crate::reliability::{Attempt, Backoff, retry_with_backoff};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_QUEUE_NAME_TEMPLATE: &str = "wf-proxy-{{id}}-{{entity}}-{{port}}";
const RECEIVE_BATCH: usize = 10;
const MAX_QUEUE_NAME_LEN: usize = 80;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExternalQueueError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),
    #[error("Queue service unavailable: {0}")]
    Unavailable(String),
    #[error("Request rejected by queue service: {0}")]
    Rejected(String),
}

impl ExternalQueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExternalQueueError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudMessage {
    pub id: String,
    pub receipt: String,
    pub body: Vec<u8>,
}

/// Client of a managed queue service.
///
/// Receiving a message hides it for the visibility timeout; it is gone only
/// once deleted by its receipt. Deleting an unknown receipt succeeds.
#[async_trait]
pub trait CloudQueueClient: Send + Sync + Debug {
    async fn enqueue(&self, queue: &str, body: &[u8]) -> Result<String, ExternalQueueError>;

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<CloudMessage>, ExternalQueueError>;

    async fn delete(&self, queue: &str, receipt: &str) -> Result<(), ExternalQueueError>;

    async fn purge(&self, queue: &str) -> Result<usize, ExternalQueueError>;

    async fn approximate_size(&self, queue: &str) -> Result<usize, ExternalQueueError>;
}

/// Builds queue names such as `wf-proxy-{{id}}-{{entity}}-{{port}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNameTemplate(String);

impl Default for QueueNameTemplate {
    fn default() -> Self {
        Self(DEFAULT_QUEUE_NAME_TEMPLATE.to_string())
    }
}

impl QueueNameTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Queue service names only allow `[A-Za-z0-9_-]`; anything else becomes `-`.
    pub fn render(&self, id: &str, entity_type: EntityType, port: &str) -> String {
        let name = self
            .0
            .replace("{{id}}", id)
            .replace("{{entity}}", entity_type.as_str())
            .replace("{{port}}", port);
        name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .take(MAX_QUEUE_NAME_LEN)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ExternalQueueConfig {
    pub client: Arc<dyn CloudQueueClient>,
    pub template: QueueNameTemplate,
    pub identity: String,
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl ExternalQueueConfig {
    pub fn new(client: Arc<dyn CloudQueueClient>, identity: impl Into<String>) -> Self {
        Self {
            client,
            template: QueueNameTemplate::default(),
            identity: identity.into(),
            visibility_timeout: Duration::from_secs(15 * 60),
            max_attempts: 5,
            backoff: Backoff::default().with_jitter(true),
        }
    }
}

#[derive(Debug)]
struct InHand {
    handle: TaskHandle,
    message_id: String,
    /// `None` until the rewritten message of a requeued task is received.
    receipt: Option<String>,
    task: DataSubmissionTask,
}

#[derive(Debug)]
struct ExternalState {
    next_handle: u64,
    in_hand: VecDeque<InHand>,
    /// Messages removed before they were received; deleted on arrival.
    discarded: HashSet<String>,
}

/// Task queue of one shard on a remote queue.
///
/// Received messages are held locally until acknowledged. A requeued task is
/// written back as a new message but keeps its place in hand, so it is peeked
/// again before anything received after it.
#[derive(Debug)]
pub struct ExternalTaskQueue {
    client: Arc<dyn CloudQueueClient>,
    queue_name: String,
    visibility_timeout: Duration,
    max_attempts: u32,
    backoff: Backoff,
    cancel: CancellationToken,
    state: Mutex<ExternalState>,
}

impl ExternalTaskQueue {
    pub fn new(queue_name: impl Into<String>, config: &ExternalQueueConfig) -> Self {
        Self {
            client: Arc::clone(&config.client),
            queue_name: queue_name.into(),
            visibility_timeout: config.visibility_timeout,
            max_attempts: config.max_attempts,
            backoff: config.backoff,
            cancel: CancellationToken::new(),
            state: Mutex::new(ExternalState {
                next_handle: 0,
                in_hand: VecDeque::new(),
                discarded: HashSet::new(),
            }),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Aborts pending retries, e.g. on shutdown.
    pub fn cancel_retries(&self) {
        self.cancel.cancel();
    }

    pub async fn append(&self, task: &DataSubmissionTask) -> Result<(), super::BufferError> {
        let body = task.to_bytes()?;
        self.enqueue(&body).await?;
        Ok(())
    }

    pub async fn size(&self) -> Result<usize, ExternalQueueError> {
        self.with_retry(|client, queue| async move { client.approximate_size(&queue).await })
            .await
    }

    pub async fn peek(
        &self,
    ) -> Result<Option<(TaskHandle, DataSubmissionTask)>, ExternalQueueError> {
        let mut state = self.state.lock().await;
        while state.in_hand.is_empty() && self.fill(&mut state).await? > 0 {}
        Ok(state
            .in_hand
            .front()
            .map(|entry| (entry.handle, entry.task.clone())))
    }

    /// Receives every visible message and returns everything held locally.
    /// Messages stay hidden for the visibility timeout afterwards.
    pub async fn iterate(&self) -> Result<Vec<(TaskHandle, DataSubmissionTask)>, ExternalQueueError> {
        let mut state = self.state.lock().await;
        while self.fill(&mut state).await? > 0 {}
        Ok(state
            .in_hand
            .iter()
            .map(|entry| (entry.handle, entry.task.clone()))
            .collect())
    }

    pub async fn remove(&self, handle: TaskHandle) -> Result<(), ExternalQueueError> {
        let mut state = self.state.lock().await;
        let Some(index) = Self::position(&state, handle) else {
            return Ok(());
        };
        if state.in_hand[index].receipt.is_none() {
            self.fill(&mut state).await?;
        }

        let Some(index) = Self::position(&state, handle) else {
            return Ok(());
        };
        self.forget(&mut state, index).await?;
        state.in_hand.remove(index);
        Ok(())
    }

    /// Writes the updated task back in place of the received message. The
    /// task stays at its position in hand.
    pub async fn requeue(
        &self,
        handle: TaskHandle,
        task: &DataSubmissionTask,
    ) -> Result<bool, super::BufferError> {
        let mut state = self.state.lock().await;
        let Some(index) = Self::position(&state, handle) else {
            return Ok(false);
        };

        let body = task.to_bytes()?;
        let message_id = self.enqueue(&body).await?;
        self.forget(&mut state, index).await?;
        let entry = &mut state.in_hand[index];
        entry.message_id = message_id;
        entry.receipt = None;
        entry.task = task.clone();
        Ok(true)
    }

    fn position(state: &ExternalState, handle: TaskHandle) -> Option<usize> {
        state.in_hand.iter().position(|e| e.handle == handle)
    }

    /// Deletes the remote message behind an in-hand entry, or marks it for
    /// deletion when it has not been received yet.
    async fn forget(&self, state: &mut ExternalState, index: usize) -> Result<(), ExternalQueueError> {
        match state.in_hand[index].receipt.clone() {
            Some(receipt) => self.delete(&receipt).await,
            None => {
                let message_id = state.in_hand[index].message_id.clone();
                state.discarded.insert(message_id);
                Ok(())
            }
        }
    }

    pub async fn clear(&self) -> Result<usize, ExternalQueueError> {
        let mut state = self.state.lock().await;
        let purged = self
            .with_retry(|client, queue| async move { client.purge(&queue).await })
            .await?;
        state.in_hand.clear();
        state.discarded.clear();
        Ok(purged)
    }

    pub async fn stats(&self) -> Result<QueueStats, ExternalQueueError> {
        let tasks = self.size().await?;
        let state = self.state.lock().await;
        Ok(QueueStats {
            tasks,
            items: state.in_hand.iter().map(|e| e.task.len()).sum(),
            oldest: state.in_hand.iter().map(|e| e.task.enqueued_at()).min(),
        })
    }

    async fn fill(&self, state: &mut ExternalState) -> Result<usize, ExternalQueueError> {
        let visibility = self.visibility_timeout;
        let messages = self
            .with_retry(|client, queue| async move {
                client.receive(&queue, RECEIVE_BATCH, visibility).await
            })
            .await?;

        let received = messages.len();
        for message in messages {
            if state.discarded.contains(&message.id) {
                self.delete(&message.receipt).await?;
                state.discarded.remove(&message.id);
                continue;
            }
            if let Some(entry) = state.in_hand.iter_mut().find(|e| e.message_id == message.id) {
                entry.receipt = Some(message.receipt);
                continue;
            }

            match DataSubmissionTask::from_bytes(&message.body) {
                Ok(task) => {
                    let handle = TaskHandle(state.next_handle);
                    state.next_handle += 1;
                    state.in_hand.push_back(InHand {
                        handle,
                        message_id: message.id,
                        receipt: Some(message.receipt),
                        task,
                    });
                }
                Err(e) => {
                    tracing::error!(
                        queue = %self.queue_name,
                        message_id = %message.id,
                        error = %e,
                        "Discarding undecodable queue message"
                    );
                    self.delete(&message.receipt).await?;
                }
            }
        }
        Ok(received)
    }

    async fn enqueue(&self, body: &[u8]) -> Result<String, ExternalQueueError> {
        let body = body.to_vec();
        self.with_retry(|client, queue| {
            let body = body.clone();
            async move { client.enqueue(&queue, &body).await }
        })
        .await
    }

    async fn delete(&self, receipt: &str) -> Result<(), ExternalQueueError> {
        self.with_retry(|client, queue| {
            let receipt = receipt.to_string();
            async move { client.delete(&queue, &receipt).await }
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, ExternalQueueError>
    where
        F: FnMut(Arc<dyn CloudQueueClient>, String) -> Fut,
        Fut: std::future::Future<Output = Result<T, ExternalQueueError>>,
    {
        retry_with_backoff(self.backoff, self.max_attempts, &self.cancel, |attempt| {
            let call = op(Arc::clone(&self.client), self.queue_name.clone());
            let queue = self.queue_name.as_str();
            async move {
                match call.await {
                    Ok(value) => Attempt::Done(value),
                    Err(e) if e.is_transient() => {
                        tracing::warn!(queue, attempt, error = %e, "Queue service call failed");
                        Attempt::Retry(e)
                    }
                    Err(e) => Attempt::Fail(e),
                }
            }
        })
        .await
    }
}

#[derive(Debug)]
struct LocalMessage {
    id: String,
    receipt: Option<String>,
    body: Vec<u8>,
    visible_at: Instant,
}

/// In-process queue service with the remote service's visibility semantics.
///
/// Used when no remote service is configured and in tests; `fail_next` makes
/// the next calls fail with `Unavailable`.
#[derive(Debug, Default)]
pub struct LocalCloudQueue {
    queues: Mutex<HashMap<String, VecDeque<LocalMessage>>>,
    failures: AtomicUsize,
}

impl LocalCloudQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: usize) {
        self.failures.store(calls, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ExternalQueueError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(ExternalQueueError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl CloudQueueClient for LocalCloudQueue {
    async fn enqueue(&self, queue: &str, body: &[u8]) -> Result<String, ExternalQueueError> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let id = Uuid::new_v4().to_string();
        queues
            .entry(queue.to_string())
            .or_default()
            .push_back(LocalMessage {
                id: id.clone(),
                receipt: None,
                body: body.to_vec(),
                visible_at: Instant::now(),
            });
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<CloudMessage>, ExternalQueueError> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let Some(messages) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut received = Vec::new();
        for message in messages.iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            if message.visible_at <= now {
                let receipt = Uuid::new_v4().to_string();
                message.visible_at = now + visibility_timeout;
                message.receipt = Some(receipt.clone());
                received.push(CloudMessage {
                    id: message.id.clone(),
                    receipt,
                    body: message.body.clone(),
                });
            }
        }
        Ok(received)
    }

    async fn delete(&self, queue: &str, receipt: &str) -> Result<(), ExternalQueueError> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        if let Some(messages) = queues.get_mut(queue) {
            messages.retain(|m| m.receipt.as_deref() != Some(receipt));
        }
        Ok(())
    }

    async fn purge(&self, queue: &str) -> Result<usize, ExternalQueueError> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        Ok(queues.remove(queue).map(|m| m.len()).unwrap_or(0))
    }

    async fn approximate_size(&self, queue: &str) -> Result<usize, ExternalQueueError> {
        self.check_available()?;
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map(|m| m.len()).unwrap_or(0))
    }
}
