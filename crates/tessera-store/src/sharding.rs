//! Sharding strategies: which directory a document goes to, and which
//! directories a deletion or a query has to visit.
//!
//! Strategies are stateless routers over an immutable list of providers. The
//! default [`IdHashShardingStrategy`] assigns a document by a stable hash of its
//! identifier, so the same identifier lands on the same shard across calls and
//! process restarts as long as the shard count is unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::directory::DirectoryProvider;
use crate::error::{StoreError, StoreResult};
use crate::types::{EntityType, ShardId};

/// Identifier of a sharding algorithm.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShardingAlgorithm {
    /// Hash of the entity identifier modulo the shard count.
    IdHash,
    /// A single directory for everything.
    NotSharded,
}

impl ShardingAlgorithm {
    /// Configuration name of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardingAlgorithm::IdHash => "id-hash",
            ShardingAlgorithm::NotSharded => "not-sharded",
        }
    }

    /// Builds the strategy over the given providers, ordered by shard id.
    pub fn build(
        &self,
        providers: Vec<Arc<dyn DirectoryProvider>>,
    ) -> StoreResult<Arc<dyn ShardingStrategy>> {
        match self {
            ShardingAlgorithm::IdHash => Ok(Arc::new(IdHashShardingStrategy::new(providers)?)),
            ShardingAlgorithm::NotSharded => Ok(Arc::new(NotShardedStrategy::new(providers)?)),
        }
    }
}

impl fmt::Display for ShardingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardingAlgorithm {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id-hash" => Ok(ShardingAlgorithm::IdHash),
            "not-sharded" => Ok(ShardingAlgorithm::NotSharded),
            other => Err(StoreError::config(format!(
                "unknown sharding strategy: {}",
                other
            ))),
        }
    }
}

/// Immutable sharding settings of one entity type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardingConfig {
    entity_type: EntityType,
    shard_count: u32,
    index_names: Vec<String>,
    algorithm: ShardingAlgorithm,
}

impl ShardingConfig {
    /// Validates and builds the sharding settings.
    ///
    /// Without an explicit algorithm, one shard means `not-sharded` and more
    /// than one means `id-hash`. Directory names default to `<EntityType>` for
    /// a single unsharded directory and `<EntityType>.<shard>` otherwise.
    pub fn new(
        entity_type: EntityType,
        shard_count: u32,
        algorithm: Option<ShardingAlgorithm>,
        name_overrides: &BTreeMap<u32, String>,
    ) -> StoreResult<Self> {
        if shard_count < 1 {
            return Err(StoreError::config(format!(
                "{}: shard_count must be at least 1, got {}",
                entity_type, shard_count
            )));
        }
        let algorithm = algorithm.unwrap_or(if shard_count > 1 {
            ShardingAlgorithm::IdHash
        } else {
            ShardingAlgorithm::NotSharded
        });
        if algorithm == ShardingAlgorithm::NotSharded && shard_count > 1 {
            return Err(StoreError::config(format!(
                "{}: not-sharded strategy cannot use {} shards",
                entity_type, shard_count
            )));
        }

        let index_names = (0..shard_count)
            .map(|i| match name_overrides.get(&i) {
                Some(name) => name.clone(),
                None if algorithm == ShardingAlgorithm::NotSharded => {
                    entity_type.as_str().to_string()
                }
                None => format!("{}.{}", entity_type, i),
            })
            .collect::<Vec<_>>();
        if let Some(empty) = index_names.iter().position(|n| n.is_empty()) {
            return Err(StoreError::config(format!(
                "{}: index name of shard {} must not be empty",
                entity_type, empty
            )));
        }

        Ok(Self {
            entity_type,
            shard_count,
            index_names,
            algorithm,
        })
    }

    /// Entity type these settings belong to.
    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    /// Number of shards, at least 1.
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Directory names indexed by shard id.
    pub fn index_names(&self) -> &[String] {
        &self.index_names
    }

    /// Sharding algorithm.
    pub fn algorithm(&self) -> ShardingAlgorithm {
        self.algorithm
    }
}

/// Chooses directories for additions, deletions and queries of one entity type.
pub trait ShardingStrategy: Send + Sync + fmt::Debug {
    /// All directories, ordered by shard id.
    fn providers(&self) -> &[Arc<dyn DirectoryProvider>];

    /// The single directory a document with this identifier is written to.
    fn provider_for_addition(&self, entity_type: &EntityType, id: &str)
        -> Arc<dyn DirectoryProvider>;

    /// Directories a deletion has to visit.
    ///
    /// With a known identifier this is the addition directory. Without one
    /// (bulk or criteria deletes) the deletion is broadcast to every directory.
    fn providers_for_deletion(
        &self,
        entity_type: &EntityType,
        id: Option<&str>,
    ) -> Vec<Arc<dyn DirectoryProvider>> {
        match id {
            Some(id) => vec![self.provider_for_addition(entity_type, id)],
            None => self.providers().to_vec(),
        }
    }

    /// Directories a query over this entity type has to read.
    fn providers_for_query(&self) -> Vec<Arc<dyn DirectoryProvider>> {
        self.providers().to_vec()
    }
}

/// Stable 32-bit string hash: `h = 31 * h + c` over UTF-16 code units with
/// wrapping arithmetic.
///
/// The result is independent of process, platform and hasher seeds, and may
/// be negative.
pub fn stable_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(i32::from(c)))
}

/// Reduces a possibly negative hash to a shard in `[0, shard_count)`.
pub fn shard_for_hash(hash: i32, shard_count: u32) -> ShardId {
    debug_assert!(shard_count > 0);
    let shard = i64::from(hash).rem_euclid(i64::from(shard_count.max(1)));
    ShardId::new(shard as u32)
}

/// Shard of an identifier under the id-hash algorithm.
pub fn shard_for_id(id: &str, shard_count: u32) -> ShardId {
    shard_for_hash(stable_hash(id), shard_count)
}

/// Assigns documents by a stable hash of their identifier.
#[derive(Debug)]
pub struct IdHashShardingStrategy {
    providers: Vec<Arc<dyn DirectoryProvider>>,
}

impl IdHashShardingStrategy {
    /// Creates the strategy. Fails when there are no providers.
    pub fn new(providers: Vec<Arc<dyn DirectoryProvider>>) -> StoreResult<Self> {
        if providers.is_empty() {
            return Err(StoreError::config(
                "id-hash sharding needs at least one directory",
            ));
        }
        Ok(Self { providers })
    }

    /// Shard an identifier is assigned to.
    pub fn shard_for(&self, id: &str) -> ShardId {
        shard_for_id(id, self.providers.len() as u32)
    }
}

impl ShardingStrategy for IdHashShardingStrategy {
    fn providers(&self) -> &[Arc<dyn DirectoryProvider>] {
        &self.providers
    }

    fn provider_for_addition(
        &self,
        _entity_type: &EntityType,
        id: &str,
    ) -> Arc<dyn DirectoryProvider> {
        self.providers[self.shard_for(id).as_index()].clone()
    }
}

/// One directory stands in for addition, deletion and query.
#[derive(Debug)]
pub struct NotShardedStrategy {
    providers: Vec<Arc<dyn DirectoryProvider>>,
}

impl NotShardedStrategy {
    /// Creates the strategy. Fails unless exactly one provider is given.
    pub fn new(providers: Vec<Arc<dyn DirectoryProvider>>) -> StoreResult<Self> {
        if providers.len() != 1 {
            return Err(StoreError::config(format!(
                "not-sharded strategy needs exactly one directory, got {}",
                providers.len()
            )));
        }
        Ok(Self { providers })
    }
}

impl ShardingStrategy for NotShardedStrategy {
    fn providers(&self) -> &[Arc<dyn DirectoryProvider>] {
        &self.providers
    }

    fn provider_for_addition(
        &self,
        _entity_type: &EntityType,
        _id: &str,
    ) -> Arc<dyn DirectoryProvider> {
        self.providers[0].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;

    fn memory_providers(names: &[&str]) -> Vec<Arc<dyn DirectoryProvider>> {
        names
            .iter()
            .map(|n| Arc::new(MemoryDirectory::new(*n)) as Arc<dyn DirectoryProvider>)
            .collect()
    }

    #[test]
    fn test_stable_hash_known_values() {
        assert_eq!(stable_hash(""), 0);
        assert_eq!(stable_hash("1"), 49);
        assert_eq!(stable_hash("2"), 50);
        assert_eq!(stable_hash("abc"), 96354);
    }

    #[test]
    fn test_stable_hash_can_be_negative() {
        let hash = stable_hash("polygenelubricants");
        assert!(hash < 0, "expected wrap-around, got {}", hash);
        let shard = shard_for_hash(hash, 3);
        assert!(shard.as_u32() < 3);
    }

    #[test]
    fn test_shard_for_hash_negative_values() {
        assert_eq!(shard_for_hash(-1, 2), ShardId::new(1));
        assert_eq!(shard_for_hash(-4, 3), ShardId::new(2));
        assert_eq!(shard_for_hash(i32::MIN, 7).as_u32(), 5);
        assert_eq!(shard_for_hash(i32::MAX, 1), ShardId::new(0));
    }

    #[test]
    fn test_id_hash_two_shards() {
        let providers = memory_providers(&["Animal.0", "Animal.1"]);
        let strategy = IdHashShardingStrategy::new(providers.clone()).unwrap();
        let animal = EntityType::new("Animal");

        let one = strategy.provider_for_addition(&animal, "1");
        let two = strategy.provider_for_addition(&animal, "2");
        assert!(Arc::ptr_eq(&one, &providers[1]));
        assert!(Arc::ptr_eq(&two, &providers[0]));
    }

    #[test]
    fn test_deletion_with_and_without_id() {
        let providers = memory_providers(&["Animal.0", "Animal.1", "Animal.2"]);
        let strategy = IdHashShardingStrategy::new(providers).unwrap();
        let animal = EntityType::new("Animal");

        let targeted = strategy.providers_for_deletion(&animal, Some("42"));
        assert_eq!(targeted.len(), 1);
        assert_eq!(
            targeted[0].name(),
            strategy.provider_for_addition(&animal, "42").name()
        );

        let broadcast = strategy.providers_for_deletion(&animal, None);
        assert_eq!(broadcast.len(), 3);
        assert_eq!(strategy.providers_for_query().len(), 3);
    }

    #[test]
    fn test_id_hash_requires_providers() {
        let err = IdHashShardingStrategy::new(Vec::new()).unwrap_err();
        assert!(matches!(err, StoreError::Configuration { .. }));
    }

    #[test]
    fn test_not_sharded() {
        let strategy = NotShardedStrategy::new(memory_providers(&["Furniture"])).unwrap();
        let furniture = EntityType::new("Furniture");
        assert_eq!(strategy.provider_for_addition(&furniture, "9").name(), "Furniture");
        assert_eq!(strategy.providers_for_deletion(&furniture, None).len(), 1);
        assert!(NotShardedStrategy::new(memory_providers(&["a", "b"])).is_err());
    }

    #[test]
    fn test_sharding_config_defaults() {
        let none = BTreeMap::new();
        let sharded = ShardingConfig::new(EntityType::new("Animal"), 2, None, &none).unwrap();
        assert_eq!(sharded.algorithm(), ShardingAlgorithm::IdHash);
        assert_eq!(sharded.index_names(), ["Animal.0", "Animal.1"]);

        let single = ShardingConfig::new(EntityType::new("Furniture"), 1, None, &none).unwrap();
        assert_eq!(single.algorithm(), ShardingAlgorithm::NotSharded);
        assert_eq!(single.index_names(), ["Furniture"]);

        let hashed_single = ShardingConfig::new(
            EntityType::new("Plant"),
            1,
            Some(ShardingAlgorithm::IdHash),
            &none,
        )
        .unwrap();
        assert_eq!(hashed_single.index_names(), ["Plant.0"]);
    }

    #[test]
    fn test_sharding_config_rejects_invalid() {
        let none = BTreeMap::new();
        assert!(ShardingConfig::new(EntityType::new("Animal"), 0, None, &none).is_err());
        assert!(ShardingConfig::new(
            EntityType::new("Animal"),
            3,
            Some(ShardingAlgorithm::NotSharded),
            &none
        )
        .is_err());

        let mut empty_name = BTreeMap::new();
        empty_name.insert(0, String::new());
        assert!(ShardingConfig::new(EntityType::new("Animal"), 2, None, &empty_name).is_err());
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!("id-hash".parse::<ShardingAlgorithm>().unwrap(), ShardingAlgorithm::IdHash);
        assert_eq!(
            "not-sharded".parse::<ShardingAlgorithm>().unwrap(),
            ShardingAlgorithm::NotSharded
        );
        assert!("round-robin".parse::<ShardingAlgorithm>().is_err());
    }
}
