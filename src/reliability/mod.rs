pub mod blocked;
pub mod health;
pub mod metrics;
pub mod rate_limiter;
pub mod retry;

pub use blocked::{BlockedSample, BlockedSampler};
pub use health::{BacklogHealth, HealthConfig, HealthReport, HealthStatus, ShardHealth};
pub use metrics::{MetricsCollector, MetricsError, PipelineMetrics, PipelineMetricsSnapshot};
pub use rate_limiter::{RateLimiter, RateLimiterSnapshot};
pub use retry::{Attempt, Backoff, retry_with_backoff};

use crate::domain::EntityType;
use crate::properties::PropertiesRegistry;
use std::collections::HashMap;
use std::sync::Arc;

/// Rate limiters and blocked-samples sinks, one of each per entity type.
///
/// Pipelines of the same entity type share both.
#[derive(Debug, Clone)]
pub struct EntityGovernors {
    limiters: Arc<HashMap<EntityType, Arc<RateLimiter>>>,
    samplers: Arc<HashMap<EntityType, Arc<BlockedSampler>>>,
}

impl EntityGovernors {
    pub fn new(properties: &PropertiesRegistry) -> Self {
        let limiters = EntityType::ALL
            .into_iter()
            .map(|entity| (entity, Arc::new(RateLimiter::new(properties.get(entity)))))
            .collect();
        let samplers = EntityType::ALL
            .into_iter()
            .map(|entity| (entity, Arc::new(BlockedSampler::new(properties.get(entity)))))
            .collect();

        Self {
            limiters: Arc::new(limiters),
            samplers: Arc::new(samplers),
        }
    }

    pub fn limiter(&self, entity_type: EntityType) -> Option<Arc<RateLimiter>> {
        self.limiters.get(&entity_type).cloned()
    }

    pub fn sampler(&self, entity_type: EntityType) -> Option<Arc<BlockedSampler>> {
        self.samplers.get(&entity_type).cloned()
    }
}
