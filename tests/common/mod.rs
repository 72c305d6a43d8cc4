#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use telemetry_proxy::buffer::Buffer;
use telemetry_proxy::domain::{HandlerKey, Item};
use telemetry_proxy::properties::PropertiesRegistry;
use telemetry_proxy::reliability::MetricsCollector;
use telemetry_proxy::sender::{BackendApi, SenderTaskFactory, SubmissionOutcome};

#[derive(Debug, Clone)]
pub struct Submission {
    pub key: HandlerKey,
    pub items: Vec<Item>,
    pub outcome: SubmissionOutcome,
}

/// Answers submissions from a script and delivers everything once the
/// script runs out.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<SubmissionOutcome>>,
    submissions: Mutex<Vec<Submission>>,
}

impl ScriptedBackend {
    pub fn new(script: impl IntoIterator<Item = SubmissionOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            submissions: Mutex::new(Vec::new()),
        }
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    pub fn delivered_items(&self) -> Vec<Item> {
        self.submissions
            .lock()
            .iter()
            .filter(|s| s.outcome.is_delivered())
            .flat_map(|s| s.items.clone())
            .collect()
    }
}

#[async_trait]
impl BackendApi for ScriptedBackend {
    async fn submit(&self, key: &HandlerKey, items: &[Item]) -> SubmissionOutcome {
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(SubmissionOutcome::Delivered);
        self.submissions.lock().push(Submission {
            key: key.clone(),
            items: items.to_vec(),
            outcome: outcome.clone(),
        });
        outcome
    }
}

pub fn items(prefix: &str, n: usize) -> Vec<Item> {
    (0..n).map(|i| format!("{prefix} {i}")).collect()
}

/// Factory with fast flushes and retries capped at 50 ms.
pub fn fast_factory(backend: Arc<dyn BackendApi>) -> SenderTaskFactory {
    let properties = PropertiesRegistry::new();
    for props in properties.iter() {
        props.set_flush_interval(Duration::from_millis(10));
        props.set_max_retry_delay(Duration::from_millis(50));
    }
    let metrics = Arc::new(MetricsCollector::new().unwrap());
    SenderTaskFactory::new(backend, properties, metrics)
        .with_shutdown_timeout(Duration::from_secs(2))
}

pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Polls until `buffer` holds no persisted tasks.
pub async fn wait_until_empty(buffer: &Buffer, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if buffer.size().await.is_ok_and(|size| size == 0) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
