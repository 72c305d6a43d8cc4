#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use crate::domain::HandlerKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[cfg(feature = "metrics")]
    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] prometheus::Error),
    #[error("Metrics encoding error: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMetricsSnapshot {
    pub delivered_items: u64,
    pub delivered_batches: u64,
    pub queued_tasks: u64,
    pub queued_items: u64,
    pub dropped_items: u64,
    pub blocked_items: u64,
    pub retried_tasks: u64,
    pub rate_limited_batches: u64,
    pub split_batches: u64,
    pub failed_submissions: u64,
}

#[cfg(feature = "metrics")]
#[derive(Clone)]
struct PrometheusChildren {
    delivered_items: IntCounter,
    queued_items: IntCounter,
    dropped_items: IntCounter,
    blocked_items: IntCounter,
    retried_tasks: IntCounter,
    rate_limited_batches: IntCounter,
}

#[cfg(feature = "metrics")]
impl std::fmt::Debug for PrometheusChildren {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrometheusChildren")
    }
}

/// Lock-free delivery counters of one pipeline.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    delivered_items: AtomicU64,
    delivered_batches: AtomicU64,
    queued_tasks: AtomicU64,
    queued_items: AtomicU64,
    dropped_items: AtomicU64,
    blocked_items: AtomicU64,
    retried_tasks: AtomicU64,
    rate_limited_batches: AtomicU64,
    split_batches: AtomicU64,
    failed_submissions: AtomicU64,
    #[cfg(feature = "metrics")]
    prometheus: Option<PrometheusChildren>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_delivered(&self, items: usize) {
        self.delivered_items.fetch_add(items as u64, Ordering::Relaxed);
        self.delivered_batches.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        if let Some(p) = &self.prometheus {
            p.delivered_items.inc_by(items as u64);
        }
    }

    pub fn record_queued(&self, items: usize) {
        self.queued_tasks.fetch_add(1, Ordering::Relaxed);
        self.queued_items.fetch_add(items as u64, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        if let Some(p) = &self.prometheus {
            p.queued_items.inc_by(items as u64);
        }
    }

    pub fn record_dropped(&self, items: usize) {
        self.dropped_items.fetch_add(items as u64, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        if let Some(p) = &self.prometheus {
            p.dropped_items.inc_by(items as u64);
        }
    }

    pub fn record_blocked(&self, items: usize) {
        self.blocked_items.fetch_add(items as u64, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        if let Some(p) = &self.prometheus {
            p.blocked_items.inc_by(items as u64);
        }
    }

    pub fn record_retry(&self) {
        self.retried_tasks.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        if let Some(p) = &self.prometheus {
            p.retried_tasks.inc();
        }
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_batches.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        if let Some(p) = &self.prometheus {
            p.rate_limited_batches.inc();
        }
    }

    pub fn record_split(&self) {
        self.split_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_submission(&self) {
        self.failed_submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            delivered_items: self.delivered_items.load(Ordering::Relaxed),
            delivered_batches: self.delivered_batches.load(Ordering::Relaxed),
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            queued_items: self.queued_items.load(Ordering::Relaxed),
            dropped_items: self.dropped_items.load(Ordering::Relaxed),
            blocked_items: self.blocked_items.load(Ordering::Relaxed),
            retried_tasks: self.retried_tasks.load(Ordering::Relaxed),
            rate_limited_batches: self.rate_limited_batches.load(Ordering::Relaxed),
            split_batches: self.split_batches.load(Ordering::Relaxed),
            failed_submissions: self.failed_submissions.load(Ordering::Relaxed),
        }
    }
}

/// Process-wide metrics registry handing out per-pipeline counters.
#[derive(Clone)]
pub struct MetricsCollector {
    #[cfg(feature = "metrics")]
    registry: Arc<Registry>,
    #[cfg(feature = "metrics")]
    items: IntCounterVec,
    #[cfg(feature = "metrics")]
    retries: IntCounterVec,
    #[cfg(feature = "metrics")]
    rate_limited: IntCounterVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, MetricsError> {
        #[cfg(feature = "metrics")]
        {
            let registry = Arc::new(Registry::new());

            let items = IntCounterVec::new(
                Opts::new("proxy_items_total", "Telemetry items by delivery outcome"),
                &["entity", "handle", "outcome"], // delivered, queued, dropped, blocked
            )?;
            registry.register(Box::new(items.clone()))?;

            let retries = IntCounterVec::new(
                Opts::new("proxy_task_retries_total", "Persisted retry attempts"),
                &["entity", "handle"],
            )?;
            registry.register(Box::new(retries.clone()))?;

            let rate_limited = IntCounterVec::new(
                Opts::new("proxy_rate_limited_batches_total", "Batches held back by rate limits"),
                &["entity", "handle"],
            )?;
            registry.register(Box::new(rate_limited.clone()))?;

            Ok(Self {
                registry,
                items,
                retries,
                rate_limited,
            })
        }

        #[cfg(not(feature = "metrics"))]
        {
            Ok(Self {})
        }
    }

    pub fn pipeline(&self, key: &HandlerKey) -> Arc<PipelineMetrics> {
        #[cfg(feature = "metrics")]
        {
            let entity = key.entity_type().as_str();
            let handle = key.handle();
            let items = |outcome: &str| self.items.with_label_values(&[entity, handle, outcome]);
            Arc::new(PipelineMetrics {
                prometheus: Some(PrometheusChildren {
                    delivered_items: items("delivered"),
                    queued_items: items("queued"),
                    dropped_items: items("dropped"),
                    blocked_items: items("blocked"),
                    retried_tasks: self.retries.with_label_values(&[entity, handle]),
                    rate_limited_batches: self.rate_limited.with_label_values(&[entity, handle]),
                }),
                ..PipelineMetrics::default()
            })
        }

        #[cfg(not(feature = "metrics"))]
        {
            let _ = key;
            Arc::new(PipelineMetrics::new())
        }
    }

    /// Prometheus text exposition of every registered counter.
    pub fn gather_text(&self) -> Result<String, MetricsError> {
        #[cfg(feature = "metrics")]
        {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            encoder.encode(&self.registry.gather(), &mut buffer)?;
            String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
        }

        #[cfg(not(feature = "metrics"))]
        {
            Ok(String::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntityType;

    #[test]
    fn test_pipeline_counters_accumulate() {
        let metrics = PipelineMetrics::new();
        metrics.record_delivered(40);
        metrics.record_delivered(2);
        metrics.record_queued(10);
        metrics.record_dropped(3);
        metrics.record_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.delivered_items, 42);
        assert_eq!(snapshot.delivered_batches, 2);
        assert_eq!(snapshot.queued_tasks, 1);
        assert_eq!(snapshot.queued_items, 10);
        assert_eq!(snapshot.dropped_items, 3);
        assert_eq!(snapshot.retried_tasks, 1);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_prometheus_mirror_is_labelled_by_pipeline() {
        let collector = MetricsCollector::new().unwrap();
        let key = HandlerKey::new(EntityType::Points, "2878");
        collector.pipeline(&key).record_delivered(5);

        let text = collector.gather_text().unwrap();
        assert!(text.contains("proxy_items_total"));
        assert!(text.contains("handle=\"2878\""));
        assert!(text.contains("outcome=\"delivered\""));
    }
}
