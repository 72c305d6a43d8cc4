use super::entity::EntityType;
use super::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one pipeline: an entity type on a handle (usually a port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerKey {
    entity_type: EntityType,
    handle: String,
}

impl HandlerKey {
    pub fn new(entity_type: EntityType, handle: impl Into<String>) -> Self {
        Self {
            entity_type,
            handle: handle.into(),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity_type, self.handle)
    }
}

/// Storage tier backing the task queues of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Memory,
    Disk,
    External,
}

/// Per-pipeline queue descriptor, fixed once the pipeline starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    key: HandlerKey,
    shards: usize,
    sharding_enabled: bool,
    tier: TierKind,
}

impl QueueInfo {
    pub fn new(
        key: HandlerKey,
        shards: usize,
        sharding_enabled: bool,
        tier: TierKind,
    ) -> Result<Self, DomainError> {
        if shards == 0 {
            return Err(DomainError::InvalidShardCount {
                handle: key.to_string(),
                shards,
            });
        }

        Ok(Self {
            key,
            shards,
            sharding_enabled,
            tier,
        })
    }

    pub fn key(&self) -> &HandlerKey {
        &self.key
    }

    pub fn shards(&self) -> usize {
        self.shards
    }

    pub fn sharding_enabled(&self) -> bool {
        self.sharding_enabled
    }

    pub fn tier(&self) -> TierKind {
        self.tier
    }
}
