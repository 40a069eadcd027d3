//! Search configuration: directory providers, refresh settings and sharding.
//!
//! Settings resolve shard override > entity section > `[default]` > built-in
//! default. Everything is validated once, at startup, by [`SearchConfig::resolve`].

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::sharding::{ShardingAlgorithm, ShardingConfig};
use crate::types::{EntityType, ShardId};

/// Default location of local indexes.
pub const DEFAULT_INDEX_BASE: &str = "./indexes";
/// Default refresh interval of master and slave directories (one hour).
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 3600;
/// Default number of published generations a master keeps.
pub const DEFAULT_RETAINED_GENERATIONS: usize = 2;
/// Default bound on a single slave copy.
pub const DEFAULT_COPY_TIMEOUT_SECS: u64 = 600;
/// Smallest accepted refresh interval.
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 1;

/// The closed set of directory provider implementations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirectoryProviderKind {
    /// Writable index that periodically publishes snapshots.
    FilesystemMaster,
    /// Read-only copy that periodically adopts published snapshots.
    FilesystemSlave,
    /// Plain writable on-disk index, no replication.
    FilesystemStandalone,
    /// Volatile index kept in memory.
    InMemory,
}

impl DirectoryProviderKind {
    /// All kinds, in declaration order.
    pub const ALL: [DirectoryProviderKind; 4] = [
        DirectoryProviderKind::FilesystemMaster,
        DirectoryProviderKind::FilesystemSlave,
        DirectoryProviderKind::FilesystemStandalone,
        DirectoryProviderKind::InMemory,
    ];

    /// Configuration name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectoryProviderKind::FilesystemMaster => "filesystem-master",
            DirectoryProviderKind::FilesystemSlave => "filesystem-slave",
            DirectoryProviderKind::FilesystemStandalone => "filesystem-standalone",
            DirectoryProviderKind::InMemory => "in-memory",
        }
    }

    /// Whether the kind runs a periodic refresh task.
    pub fn is_replicated(&self) -> bool {
        matches!(
            self,
            DirectoryProviderKind::FilesystemMaster | DirectoryProviderKind::FilesystemSlave
        )
    }
}

impl fmt::Display for DirectoryProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DirectoryProviderKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DirectoryProviderKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StoreError::config(format!("unknown directory provider: {}", s)))
    }
}

/// Settings that may appear at default, entity, or shard level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    /// Provider implementation.
    pub directory_provider: Option<DirectoryProviderKind>,
    /// Root of local indexes (`indexBase`).
    pub index_base: Option<PathBuf>,
    /// Root of published snapshots (`sourceBase`), required for master and slave.
    pub source_base: Option<PathBuf>,
    /// Seconds between refresh ticks.
    pub refresh_interval_secs: Option<u64>,
    /// Published generations a master keeps.
    pub retained_generations: Option<usize>,
    /// Upper bound in seconds on one slave copy.
    pub copy_timeout_secs: Option<u64>,
    /// Sharding algorithm.
    pub sharding_strategy: Option<ShardingAlgorithm>,
    /// Number of shards.
    pub shard_count: Option<u32>,
}

impl DirectorySettings {
    /// Returns these settings with unset fields taken from `fallback`.
    pub fn merged(&self, fallback: &DirectorySettings) -> DirectorySettings {
        DirectorySettings {
            directory_provider: self.directory_provider.or(fallback.directory_provider),
            index_base: self.index_base.clone().or_else(|| fallback.index_base.clone()),
            source_base: self
                .source_base
                .clone()
                .or_else(|| fallback.source_base.clone()),
            refresh_interval_secs: self.refresh_interval_secs.or(fallback.refresh_interval_secs),
            retained_generations: self.retained_generations.or(fallback.retained_generations),
            copy_timeout_secs: self.copy_timeout_secs.or(fallback.copy_timeout_secs),
            sharding_strategy: self.sharding_strategy.or(fallback.sharding_strategy),
            shard_count: self.shard_count.or(fallback.shard_count),
        }
    }
}

/// Per-shard overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardOverride {
    /// Directory name replacing `<EntityType>.<shard>`.
    pub index_name: Option<String>,
    /// Directory settings for this shard only.
    #[serde(flatten)]
    pub settings: DirectorySettings,
}

/// Per-entity section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    /// Settings for every shard of the entity.
    #[serde(flatten)]
    pub settings: DirectorySettings,
    /// Overrides keyed by shard index.
    pub shards: BTreeMap<String, ShardOverride>,
}

/// Top-level search configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Settings applying to every entity.
    pub default: DirectorySettings,
    /// Entity sections keyed by entity type name.
    pub entities: BTreeMap<String, EntityConfig>,
}

/// Fully resolved settings of one physical directory.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectorySpec {
    /// Stable directory name, e.g. `Animal.1`.
    pub name: String,
    /// Owning entity type.
    pub entity_type: EntityType,
    /// Shard index within the entity.
    pub shard: ShardId,
    /// Provider implementation.
    pub kind: DirectoryProviderKind,
    /// Root of local indexes.
    pub index_base: PathBuf,
    /// Root of published snapshots.
    pub source_base: Option<PathBuf>,
    /// Time between refresh ticks.
    pub refresh_interval: Duration,
    /// Published generations a master keeps.
    pub retained_generations: usize,
    /// Upper bound on one slave copy.
    pub copy_timeout: Duration,
}

impl DirectorySpec {
    /// Local directory of this index (`index_base/<name>`).
    pub fn index_dir(&self) -> PathBuf {
        self.index_base.join(&self.name)
    }

    /// Publish directory of this index (`source_base/<name>`).
    pub fn source_dir(&self) -> StoreResult<PathBuf> {
        self.source_base
            .as_ref()
            .map(|base| base.join(&self.name))
            .ok_or_else(|| {
                StoreError::config(format!(
                    "directory {} ({}) requires source_base",
                    self.name, self.kind
                ))
            })
    }
}

/// Resolved sharding and directory layout of one entity type.
#[derive(Debug, Clone)]
pub struct EntityPlan {
    /// Sharding configuration.
    pub sharding: ShardingConfig,
    /// One entry per shard, indexed by shard id.
    pub directories: Vec<DirectorySpec>,
}

impl SearchConfig {
    /// Loads a configuration file, choosing the format by extension.
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Self::from_toml_str(&contents),
            "json" => serde_json::from_str(&contents)
                .map_err(|e| StoreError::config(format!("invalid JSON config: {}", e))),
            _ => Err(StoreError::config(format!(
                "unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Parses a TOML configuration.
    pub fn from_toml_str(contents: &str) -> StoreResult<Self> {
        toml::from_str(contents).map_err(|e| StoreError::config(format!("invalid TOML config: {}", e)))
    }

    /// Checks the configuration without keeping the result.
    pub fn validate(&self) -> StoreResult<()> {
        self.resolve().map(|_| ())
    }

    /// Resolves every entity into its sharding config and directory specs.
    pub fn resolve(&self) -> StoreResult<Vec<EntityPlan>> {
        let mut plans = Vec::with_capacity(self.entities.len());
        let mut seen_names = HashSet::new();

        for (entity_name, entity) in &self.entities {
            if entity_name.is_empty() {
                return Err(StoreError::config("entity type name must not be empty"));
            }
            let entity_type = EntityType::new(entity_name.as_str());
            let entity_settings = entity.settings.merged(&self.default);
            let shard_count = entity_settings.shard_count.unwrap_or(1);

            let mut overrides: BTreeMap<u32, &ShardOverride> = BTreeMap::new();
            for (key, shard) in &entity.shards {
                let index: u32 = key.parse().map_err(|_| {
                    StoreError::config(format!(
                        "{}: shard key {:?} is not a shard index",
                        entity_name, key
                    ))
                })?;
                overrides.insert(index, shard);
            }

            let name_overrides: BTreeMap<u32, String> = overrides
                .iter()
                .filter_map(|(i, o)| o.index_name.clone().map(|n| (*i, n)))
                .collect();
            let sharding = ShardingConfig::new(
                entity_type.clone(),
                shard_count,
                entity_settings.sharding_strategy,
                &name_overrides,
            )?;
            if let Some(index) = overrides.keys().find(|i| **i >= shard_count) {
                return Err(StoreError::config(format!(
                    "{}: override for shard {} but shard_count is {}",
                    entity_name, index, shard_count
                )));
            }

            let mut directories = Vec::with_capacity(shard_count as usize);
            for (i, name) in sharding.index_names().iter().enumerate() {
                let shard = ShardId::new(i as u32);
                let settings = match overrides.get(&shard.as_u32()) {
                    Some(o) => o.settings.merged(&entity_settings),
                    None => entity_settings.clone(),
                };
                let spec = resolve_directory(name, &entity_type, shard, &settings)?;
                if !seen_names.insert(spec.name.clone()) {
                    return Err(StoreError::config(format!(
                        "index name {} is used by more than one directory",
                        spec.name
                    )));
                }
                directories.push(spec);
            }

            plans.push(EntityPlan {
                sharding,
                directories,
            });
        }

        check_disjoint_roots(&plans)?;
        Ok(plans)
    }
}

/// Rejects a local index directory that overlaps any publish directory.
///
/// Paths are compared as written, after dropping `.` components.
fn check_disjoint_roots(plans: &[EntityPlan]) -> StoreResult<()> {
    let specs: Vec<&DirectorySpec> = plans.iter().flat_map(|p| &p.directories).collect();
    let mut published = Vec::new();
    for spec in specs.iter().filter(|s| s.kind.is_replicated()) {
        published.push((spec.name.as_str(), lexical(&spec.source_dir()?)));
    }

    for spec in specs
        .iter()
        .filter(|s| s.kind != DirectoryProviderKind::InMemory)
    {
        let local = lexical(&spec.index_dir());
        for (owner, publish_dir) in &published {
            if local.starts_with(publish_dir) || publish_dir.starts_with(&local) {
                return Err(StoreError::config(format!(
                    "{}: index directory {} overlaps the publish directory {} of {}",
                    spec.name,
                    local.display(),
                    publish_dir.display(),
                    owner
                )));
            }
        }
    }
    Ok(())
}

fn lexical(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn resolve_directory(
    name: &str,
    entity_type: &EntityType,
    shard: ShardId,
    settings: &DirectorySettings,
) -> StoreResult<DirectorySpec> {
    let kind = settings
        .directory_provider
        .unwrap_or(DirectoryProviderKind::FilesystemStandalone);

    let refresh_secs = settings
        .refresh_interval_secs
        .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);
    if refresh_secs < MIN_REFRESH_INTERVAL_SECS {
        return Err(StoreError::config(format!(
            "{}: refresh_interval_secs must be at least {}",
            name, MIN_REFRESH_INTERVAL_SECS
        )));
    }

    let retained_generations = settings
        .retained_generations
        .unwrap_or(DEFAULT_RETAINED_GENERATIONS);
    if retained_generations == 0 {
        return Err(StoreError::config(format!(
            "{}: retained_generations must be at least 1",
            name
        )));
    }

    let copy_timeout_secs = settings.copy_timeout_secs.unwrap_or(DEFAULT_COPY_TIMEOUT_SECS);
    if copy_timeout_secs == 0 {
        return Err(StoreError::config(format!(
            "{}: copy_timeout_secs must be at least 1",
            name
        )));
    }

    if kind.is_replicated() && settings.source_base.is_none() {
        return Err(StoreError::config(format!(
            "{}: {} requires source_base",
            name, kind
        )));
    }

    Ok(DirectorySpec {
        name: name.to_string(),
        entity_type: entity_type.clone(),
        shard,
        kind,
        index_base: settings
            .index_base
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INDEX_BASE)),
        source_base: settings.source_base.clone(),
        refresh_interval: Duration::from_secs(refresh_secs),
        retained_generations,
        copy_timeout: Duration::from_secs(copy_timeout_secs),
    })
}
