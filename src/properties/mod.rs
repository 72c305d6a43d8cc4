pub mod decision;
pub mod entity;

pub use decision::{FailureAction, FailureKind, decide};
pub use entity::{EntityProperties, PropertiesSnapshot, QueueingLevel};

use crate::domain::EntityType;
use std::collections::HashMap;
use std::sync::Arc;

/// Runtime properties for every entity type, shared by reference.
///
/// The map itself is fixed at construction; only the fields inside each
/// `EntityProperties` change at runtime.
#[derive(Debug, Clone)]
pub struct PropertiesRegistry {
    entries: Arc<HashMap<EntityType, Arc<EntityProperties>>>,
}

impl Default for PropertiesRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertiesRegistry {
    pub fn new() -> Self {
        let entries = EntityType::ALL
            .into_iter()
            .map(|entity| (entity, Arc::new(EntityProperties::new(entity))))
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn get(&self, entity_type: EntityType) -> Arc<EntityProperties> {
        match self.entries.get(&entity_type) {
            Some(props) => Arc::clone(props),
            None => Arc::new(EntityProperties::new(entity_type)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityProperties>> {
        EntityType::ALL
            .iter()
            .filter_map(move |entity| self.entries.get(entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_hands_out_shared_properties() {
        let registry = PropertiesRegistry::new();
        let a = registry.get(EntityType::Spans);
        let b = registry.clone().get(EntityType::Spans);

        a.set_batch_size(77);
        assert_eq!(b.batch_size(), 77);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.iter().count(), EntityType::ALL.len());
    }
}
