//! Maps each directory provider kind to the factory that builds it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tessera_store::{
    DirectoryProvider, DirectoryProviderKind, DirectorySpec, MemoryDirectory, StandaloneDirectory,
    StoreError,
};
use tracing::Span;

use crate::error::ReplResult;
use crate::master::MasterDirectory;
use crate::metrics::DirectoryMetrics;
use crate::scheduler::RefreshTask;
use crate::slave::SlaveDirectory;

/// A directory built by a factory, keeping the concrete role where it matters.
#[derive(Debug, Clone)]
pub enum BuiltDirectory {
    /// A directory without a refresh role.
    Local(Arc<dyn DirectoryProvider>),
    /// A publishing master.
    Master(Arc<MasterDirectory>),
    /// A replicating slave.
    Slave(Arc<SlaveDirectory>),
}

impl BuiltDirectory {
    /// The directory as seen by routing and queries.
    pub fn provider(&self) -> Arc<dyn DirectoryProvider> {
        match self {
            BuiltDirectory::Local(p) => p.clone(),
            BuiltDirectory::Master(m) => m.clone(),
            BuiltDirectory::Slave(s) => s.clone(),
        }
    }

    /// The periodic work of a replicated directory.
    pub fn refresh_task(&self) -> Option<Arc<dyn RefreshTask>> {
        match self {
            BuiltDirectory::Local(_) => None,
            BuiltDirectory::Master(m) => Some(m.clone()),
            BuiltDirectory::Slave(s) => Some(s.clone()),
        }
    }

    /// Replication metrics, for replicated directories.
    pub fn metrics(&self) -> Option<DirectoryMetrics> {
        match self {
            BuiltDirectory::Local(_) => None,
            BuiltDirectory::Master(m) => Some(DirectoryMetrics::Master {
                directory: DirectoryProvider::name(m.as_ref()).to_string(),
                stats: m.publisher_stats(),
            }),
            BuiltDirectory::Slave(s) => Some(DirectoryMetrics::Slave {
                directory: DirectoryProvider::name(s.as_ref()).to_string(),
                state: s.replication_state(),
            }),
        }
    }
}

/// Builds a directory from its resolved spec.
pub type ProviderFactory = fn(&DirectorySpec, &Span) -> ReplResult<BuiltDirectory>;

/// Kind-to-factory table, filled once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<DirectoryProviderKind, ProviderFactory>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the four built-in kinds.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(DirectoryProviderKind::FilesystemMaster, build_master);
        registry.register(DirectoryProviderKind::FilesystemSlave, build_slave);
        registry.register(DirectoryProviderKind::FilesystemStandalone, build_standalone);
        registry.register(DirectoryProviderKind::InMemory, build_in_memory);
        registry
    }

    /// Registers or replaces the factory of a kind.
    pub fn register(&mut self, kind: DirectoryProviderKind, factory: ProviderFactory) {
        self.factories.insert(kind, factory);
    }

    /// Whether a kind can be built.
    pub fn supports(&self, kind: DirectoryProviderKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Builds the directory described by `spec`.
    pub fn build(&self, spec: &DirectorySpec, parent: &Span) -> ReplResult<BuiltDirectory> {
        let factory = self.factories.get(&spec.kind).ok_or_else(|| {
            StoreError::config(format!(
                "no directory provider registered for {} (directory {})",
                spec.kind, spec.name
            ))
        })?;
        factory(spec, parent)
    }
}

fn build_master(spec: &DirectorySpec, parent: &Span) -> ReplResult<BuiltDirectory> {
    Ok(BuiltDirectory::Master(Arc::new(MasterDirectory::open(
        spec, parent,
    )?)))
}

fn build_slave(spec: &DirectorySpec, parent: &Span) -> ReplResult<BuiltDirectory> {
    Ok(BuiltDirectory::Slave(Arc::new(SlaveDirectory::open(
        spec, parent,
    )?)))
}

fn build_standalone(spec: &DirectorySpec, _parent: &Span) -> ReplResult<BuiltDirectory> {
    let directory = StandaloneDirectory::open(spec.name.clone(), spec.index_dir())?;
    Ok(BuiltDirectory::Local(Arc::new(directory)))
}

fn build_in_memory(spec: &DirectorySpec, _parent: &Span) -> ReplResult<BuiltDirectory> {
    Ok(BuiltDirectory::Local(Arc::new(MemoryDirectory::new(
        spec.name.clone(),
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplError;
    use std::path::Path;
    use std::time::Duration;
    use tessera_store::{EntityType, ShardId};
    use tempfile::TempDir;

    fn spec(tmp: &Path, kind: DirectoryProviderKind) -> DirectorySpec {
        DirectorySpec {
            name: "Animal.0".to_string(),
            entity_type: EntityType::new("Animal"),
            shard: ShardId::new(0),
            kind,
            index_base: tmp.join("indexes"),
            source_base: Some(tmp.join("published")),
            refresh_interval: Duration::from_secs(1),
            retained_generations: 2,
            copy_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_builtin_kinds() {
        let tmp = TempDir::new().unwrap();
        let registry = ProviderRegistry::with_builtin();
        for kind in DirectoryProviderKind::ALL {
            assert!(registry.supports(kind));
            let built = registry.build(&spec(tmp.path(), kind), &Span::none()).unwrap();
            assert_eq!(built.provider().kind(), kind);
            assert_eq!(built.refresh_task().is_some(), kind.is_replicated());
            assert_eq!(built.metrics().is_some(), kind.is_replicated());
            // Each kind owns index_base/Animal.0, start from a clean slate.
            let _ = std::fs::remove_dir_all(tmp.path().join("indexes"));
        }
    }

    #[test]
    fn test_unregistered_kind() {
        let tmp = TempDir::new().unwrap();
        let registry = ProviderRegistry::new();
        let err = registry
            .build(
                &spec(tmp.path(), DirectoryProviderKind::InMemory),
                &Span::none(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ReplError::Store(StoreError::Configuration { .. })
        ));
    }
}
