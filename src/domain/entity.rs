use super::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of telemetry a pipeline carries.
///
/// Each entity type has its own runtime properties, rate limiter and
/// blocked-samples sink; pipelines of the same type share them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Points,
    DeltaCounters,
    Histograms,
    SourceTags,
    Spans,
    SpanLogs,
    Events,
    Logs,
}

impl EntityType {
    pub const ALL: [EntityType; 8] = [
        EntityType::Points,
        EntityType::DeltaCounters,
        EntityType::Histograms,
        EntityType::SourceTags,
        EntityType::Spans,
        EntityType::SpanLogs,
        EntityType::Events,
        EntityType::Logs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Points => "points",
            EntityType::DeltaCounters => "deltaCounters",
            EntityType::Histograms => "histograms",
            EntityType::SourceTags => "sourceTags",
            EntityType::Spans => "spans",
            EntityType::SpanLogs => "spanLogs",
            EntityType::Events => "events",
            EntityType::Logs => "logs",
        }
    }

    /// Maximum number of items sent in one submission.
    pub fn default_batch_size(&self) -> usize {
        match self {
            EntityType::Points | EntityType::DeltaCounters => 40_000,
            EntityType::Histograms => 10_000,
            EntityType::SourceTags => 50,
            EntityType::Spans => 5_000,
            EntityType::SpanLogs => 1_000,
            EntityType::Events => 50,
            EntityType::Logs => 1_000,
        }
    }

    /// Outbound items per second; 0.0 means unlimited.
    pub fn default_rate_limit(&self) -> f64 {
        match self {
            EntityType::SourceTags | EntityType::Events => 5.0,
            _ => 0.0,
        }
    }

    /// Tracing target receiving blocked samples for this entity type.
    pub fn blocked_logger(&self) -> &'static str {
        match self {
            EntityType::Logs => "RawBlockedLogs",
            _ => "RawBlockedPoints",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .iter()
            .copied()
            .find(|entity| entity.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::UnknownEntityType(s.to_string()))
    }
}
