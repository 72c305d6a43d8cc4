use crate::domain::HandlerKey;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Backlog older than this marks the pipeline degraded.
    pub max_backlog_age: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_backlog_age: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardHealth {
    pub shard: usize,
    pub tasks: usize,
    pub items: usize,
    pub oldest_age: Option<Duration>,
    /// Set once a fatal storage error halted the shard.
    pub halted: Option<String>,
}

/// Backlog size and age of one pipeline, the health signal of the delivery core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogHealth {
    pub key: HandlerKey,
    pub shards: Vec<ShardHealth>,
}

impl BacklogHealth {
    pub fn total_tasks(&self) -> usize {
        self.shards.iter().map(|s| s.tasks).sum()
    }

    pub fn total_items(&self) -> usize {
        self.shards.iter().map(|s| s.items).sum()
    }

    pub fn oldest_age(&self) -> Option<Duration> {
        self.shards.iter().filter_map(|s| s.oldest_age).max()
    }

    pub fn halted_shards(&self) -> Vec<usize> {
        self.shards
            .iter()
            .filter(|s| s.halted.is_some())
            .map(|s| s.shard)
            .collect()
    }

    pub fn status(&self, config: &HealthConfig) -> HealthStatus {
        if self.shards.iter().any(|s| s.halted.is_some()) {
            return HealthStatus::Unhealthy;
        }
        match self.oldest_age() {
            Some(age) if age > config.max_backlog_age => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

/// Health of every running pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub pipelines: Vec<BacklogHealth>,
}

impl HealthReport {
    pub fn generate(pipelines: Vec<BacklogHealth>, config: &HealthConfig) -> Self {
        let statuses: Vec<_> = pipelines.iter().map(|p| p.status(config)).collect();
        let overall_status = if statuses.contains(&HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if statuses.contains(&HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            overall_status,
            pipelines,
        }
    }
}
