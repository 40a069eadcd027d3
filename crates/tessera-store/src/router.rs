//! Routes entity operations to directories.
//!
//! The router maps each entity type to its immutable sharding config and
//! strategy. It is built once at startup and never mutated afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::directory::DirectoryProvider;
use crate::error::{StoreError, StoreResult};
use crate::sharding::{ShardingConfig, ShardingStrategy};
use crate::types::EntityType;

#[derive(Debug, Clone)]
struct EntityRoute {
    config: ShardingConfig,
    strategy: Arc<dyn ShardingStrategy>,
}

/// Entity type to sharding strategy map.
#[derive(Debug, Default)]
pub struct ShardRouter {
    routes: HashMap<EntityType, EntityRoute>,
    order: Vec<EntityType>,
}

impl ShardRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity type.
    ///
    /// The strategy must own exactly `config.shard_count()` directories whose
    /// names match the config, in shard order.
    pub fn register(
        &mut self,
        config: ShardingConfig,
        strategy: Arc<dyn ShardingStrategy>,
    ) -> StoreResult<()> {
        let entity = config.entity_type().clone();
        if self.routes.contains_key(&entity) {
            return Err(StoreError::config(format!(
                "entity type {} registered twice",
                entity
            )));
        }
        let names: Vec<&str> = strategy.providers().iter().map(|p| p.name()).collect();
        if names != config.index_names() {
            return Err(StoreError::config(format!(
                "{}: strategy directories {:?} do not match configured {:?}",
                entity,
                names,
                config.index_names()
            )));
        }

        tracing::debug!(
            entity = %entity,
            shards = config.shard_count(),
            algorithm = %config.algorithm(),
            "registered entity route"
        );
        self.order.push(entity.clone());
        self.routes.insert(entity, EntityRoute { config, strategy });
        Ok(())
    }

    fn route(&self, entity_type: &EntityType) -> StoreResult<&EntityRoute> {
        self.routes
            .get(entity_type)
            .ok_or_else(|| StoreError::UnknownEntity {
                entity: entity_type.to_string(),
            })
    }

    /// Registered entity types, in registration order.
    pub fn entity_types(&self) -> &[EntityType] {
        &self.order
    }

    /// Sharding config of an entity type.
    pub fn sharding_config(&self, entity_type: &EntityType) -> StoreResult<&ShardingConfig> {
        Ok(&self.route(entity_type)?.config)
    }

    /// Directory a document of this entity and identifier is written to.
    pub fn provider_for_addition(
        &self,
        entity_type: &EntityType,
        id: &str,
    ) -> StoreResult<Arc<dyn DirectoryProvider>> {
        Ok(self
            .route(entity_type)?
            .strategy
            .provider_for_addition(entity_type, id))
    }

    /// Directories a deletion has to visit; all of them when `id` is unknown.
    pub fn providers_for_deletion(
        &self,
        entity_type: &EntityType,
        id: Option<&str>,
    ) -> StoreResult<Vec<Arc<dyn DirectoryProvider>>> {
        Ok(self
            .route(entity_type)?
            .strategy
            .providers_for_deletion(entity_type, id))
    }

    /// Union of the query directories of every given entity type.
    ///
    /// Directories shared between entity types appear once, in first-seen order.
    pub fn providers_for_query(
        &self,
        entity_types: &[EntityType],
    ) -> StoreResult<Vec<Arc<dyn DirectoryProvider>>> {
        let mut seen = HashSet::new();
        let mut providers = Vec::new();
        for entity_type in entity_types {
            for provider in self.route(entity_type)?.strategy.providers_for_query() {
                if seen.insert(provider.name().to_string()) {
                    providers.push(provider);
                }
            }
        }
        Ok(providers)
    }

    /// Every directory of every entity type, deduplicated by name.
    pub fn all_providers(&self) -> Vec<Arc<dyn DirectoryProvider>> {
        let mut seen = HashSet::new();
        self.order
            .iter()
            .filter_map(|e| self.routes.get(e))
            .flat_map(|route| route.strategy.providers().iter().cloned())
            .filter(|p| seen.insert(p.name().to_string()))
            .collect()
    }
}
