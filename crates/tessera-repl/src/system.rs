//! Wires a configuration into routed, replicated directories.

use std::sync::Arc;

use parking_lot::Mutex;
use tessera_store::{
    DirectoryProvider, DirectorySpec, DirectoryStatus, Document, EntityType, Generation, Query,
    SearchConfig, SearchOutcome, ShardRouter,
};
use tracing::{info, info_span, warn, Instrument, Span};

use crate::error::{ReplError, ReplResult};
use crate::master::MasterDirectory;
use crate::metrics::{format_prometheus, DirectoryMetrics};
use crate::registry::{BuiltDirectory, ProviderRegistry};
use crate::replicator::TickOutcome;
use crate::scheduler::{RefreshScheduler, SchedulerHandle};
use crate::slave::SlaveDirectory;

#[derive(Debug)]
struct ManagedDirectory {
    spec: DirectorySpec,
    built: BuiltDirectory,
}

/// Every directory of a configuration, its router and its refresh schedulers.
#[derive(Debug)]
pub struct SearchSystem {
    router: ShardRouter,
    directories: Vec<ManagedDirectory>,
    schedulers: Mutex<Vec<SchedulerHandle>>,
    span: Span,
}

impl SearchSystem {
    /// Builds the system with the built-in provider kinds.
    pub fn build(config: &SearchConfig) -> ReplResult<Self> {
        Self::build_with(config, &ProviderRegistry::with_builtin(), &Span::current())
    }

    /// Builds the system, resolving provider kinds through `registry`.
    ///
    /// Configuration problems surface here, before anything is scheduled.
    pub fn build_with(
        config: &SearchConfig,
        registry: &ProviderRegistry,
        parent: &Span,
    ) -> ReplResult<Self> {
        let span = info_span!(parent: parent, "search_system");
        let plans = config.resolve()?;
        let mut router = ShardRouter::new();
        let mut directories = Vec::new();

        for plan in plans {
            let mut providers: Vec<Arc<dyn DirectoryProvider>> = Vec::new();
            for spec in plan.directories {
                let built = registry.build(&spec, &span)?;
                built.provider().start()?;
                providers.push(built.provider());
                directories.push(ManagedDirectory { spec, built });
            }
            let strategy = plan.sharding.algorithm().build(providers)?;
            router.register(plan.sharding, strategy)?;
        }

        span.in_scope(|| {
            info!(
                entities = router.entity_types().len(),
                directories = directories.len(),
                "search system built"
            )
        });
        Ok(Self {
            router,
            directories,
            schedulers: Mutex::new(Vec::new()),
            span,
        })
    }

    /// The entity router.
    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    /// Starts one refresh scheduler per master and slave directory.
    ///
    /// Returns the number of schedulers started. Calling it again while running
    /// starts nothing.
    pub fn start(&self) -> usize {
        let mut schedulers = self.schedulers.lock();
        if !schedulers.is_empty() {
            return 0;
        }
        for directory in &self.directories {
            if let Some(task) = directory.built.refresh_task() {
                schedulers.push(RefreshScheduler::spawn(
                    task,
                    directory.spec.refresh_interval,
                ));
            }
        }
        self.span
            .in_scope(|| info!(schedulers = schedulers.len(), "refresh started"));
        schedulers.len()
    }

    /// Stops every scheduler, waiting for in-flight ticks, then stops the directories.
    pub async fn shutdown(&self) {
        let schedulers: Vec<SchedulerHandle> = self.schedulers.lock().drain(..).collect();
        for scheduler in schedulers {
            scheduler.stop().await;
        }
        for directory in &self.directories {
            directory.built.provider().stop();
        }
        self.span.in_scope(|| info!("search system stopped"));
    }

    /// Tick counts of the running schedulers, by directory name.
    pub fn scheduler_ticks(&self) -> Vec<(String, u64)> {
        self.schedulers
            .lock()
            .iter()
            .map(|s| (s.name().to_string(), s.tick_count()))
            .collect()
    }

    /// Asks every scheduler for an immediate tick.
    pub fn trigger_all(&self) {
        for scheduler in self.schedulers.lock().iter() {
            scheduler.trigger();
        }
    }

    /// Buffers `doc` in the directory its identifier routes to.
    ///
    /// Returns the directory name. Nothing is visible until [`SearchSystem::commit`].
    pub fn index(&self, doc: Document) -> ReplResult<String> {
        let provider = self.router.provider_for_addition(&doc.entity_type, &doc.id)?;
        let mut writer = provider.writer()?;
        writer.add(doc);
        Ok(writer.directory().to_string())
    }

    /// Buffers a deletion; without an identifier every directory of the entity is visited.
    pub fn delete(&self, entity_type: &EntityType, id: Option<&str>) -> ReplResult<Vec<String>> {
        let mut touched = Vec::new();
        for provider in self.router.providers_for_deletion(entity_type, id)? {
            let mut writer = provider.writer()?;
            match id {
                Some(id) => writer.delete(entity_type, id),
                None => writer.delete_all(entity_type),
            }
            touched.push(writer.directory().to_string());
        }
        Ok(touched)
    }

    /// Commits every writable directory; read-only directories are skipped.
    pub fn commit(&self) -> ReplResult<Vec<(String, u64)>> {
        let mut versions = Vec::new();
        for directory in &self.directories {
            if matches!(directory.built, BuiltDirectory::Slave(_)) {
                continue;
            }
            let provider = directory.built.provider();
            let version = provider.writer()?.commit()?;
            versions.push((provider.name().to_string(), version));
        }
        Ok(versions)
    }

    /// Runs `query` across every directory of `entity_types`.
    pub async fn search(
        &self,
        entity_types: &[EntityType],
        query: &Query,
    ) -> ReplResult<SearchOutcome> {
        Ok(self
            .router
            .search(entity_types, query)
            .instrument(self.span.clone())
            .await?)
    }

    /// Status of every directory, in configuration order.
    pub fn statuses(&self) -> Vec<DirectoryStatus> {
        self.directories
            .iter()
            .map(|d| d.built.provider().status())
            .collect()
    }

    /// Master directories.
    pub fn masters(&self) -> Vec<Arc<MasterDirectory>> {
        self.directories
            .iter()
            .filter_map(|d| match &d.built {
                BuiltDirectory::Master(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    /// Slave directories.
    pub fn slaves(&self) -> Vec<Arc<SlaveDirectory>> {
        self.directories
            .iter()
            .filter_map(|d| match &d.built {
                BuiltDirectory::Slave(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    /// Publishes every master directory once.
    pub async fn publish_all(&self) -> Vec<(String, ReplResult<Generation>)> {
        let mut results = Vec::new();
        for master in self.masters() {
            let name = DirectoryProvider::name(master.as_ref()).to_string();
            let job = master.clone();
            let result = tokio::task::spawn_blocking(move || job.publish())
                .await
                .map_err(ReplError::task_failed)
                .and_then(|r| r);
            if let Err(e) = &result {
                self.span
                    .in_scope(|| warn!(directory = %name, error = %e, "publish failed"));
            }
            results.push((name, result));
        }
        results
    }

    /// Runs one replication tick on every slave directory, concurrently.
    pub async fn sync_all(&self) -> Vec<(String, ReplResult<TickOutcome>)> {
        let mut tasks = tokio::task::JoinSet::new();
        let slaves = self.slaves();
        for (slot, slave) in slaves.iter().cloned().enumerate() {
            tasks.spawn(async move { (slot, slave.sync().await) });
        }

        let mut results: Vec<Option<ReplResult<TickOutcome>>> =
            (0..slaves.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, result)) => results[slot] = Some(result),
                Err(e) => self
                    .span
                    .in_scope(|| warn!(error = %e, "replication task did not complete")),
            }
        }

        slaves
            .iter()
            .zip(results)
            .map(|(slave, result)| {
                let name = DirectoryProvider::name(slave.as_ref()).to_string();
                let result = result.unwrap_or_else(|| {
                    Err(ReplError::Io(std::io::Error::other(
                        "replication task did not complete",
                    )))
                });
                (name, result)
            })
            .collect()
    }

    /// Replication metrics of every master and slave.
    pub fn metrics(&self) -> Vec<DirectoryMetrics> {
        self.directories
            .iter()
            .filter_map(|d| d.built.metrics())
            .collect()
    }

    /// Replication metrics in Prometheus text format.
    pub fn metrics_text(&self) -> String {
        format_prometheus(&self.metrics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_store::StoreError;

    const SHARDED: &str = r#"
        [default]
        directory_provider = "in-memory"

        [entities.Animal]
        shard_count = 2
        [entities.Animal.shards.0]
        index_name = "Animal00"

        [entities.Furniture]
    "#;

    fn build(toml: &str) -> SearchSystem {
        SearchSystem::build(&SearchConfig::from_toml_str(toml).unwrap()).unwrap()
    }

    fn animal(id: &str, name: &str, color: &str) -> Document {
        Document::new("Animal", id)
            .with_field("name", name)
            .with_field("color", color)
    }

    #[tokio::test]
    async fn test_index_routes_and_search_spans_entities() {
        let system = build(SHARDED);
        assert_eq!(system.index(animal("1", "Elephant", "grey")).unwrap(), "Animal.1");
        assert_eq!(system.index(animal("2", "Bear", "brown")).unwrap(), "Animal00");
        system.index(animal("3", "Mouse", "grey")).unwrap();
        system
            .index(
                Document::new("Furniture", "1")
                    .with_field("name", "Chair")
                    .with_field("color", "blue"),
            )
            .unwrap();
        system.commit().unwrap();

        let query = Query::parse("name:mouse OR name:bear OR color:blue").unwrap();
        let outcome = system
            .search(
                &[EntityType::new("Animal"), EntityType::new("Furniture")],
                &query,
            )
            .await
            .unwrap();
        assert!(!outcome.is_partial());
        assert_eq!(outcome.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_without_id_reaches_every_shard() {
        let system = build(SHARDED);
        system.index(animal("1", "Elephant", "grey")).unwrap();
        system.index(animal("2", "Bear", "brown")).unwrap();
        system.commit().unwrap();

        let animal_type = EntityType::new("Animal");
        let touched = system.delete(&animal_type, None).unwrap();
        assert_eq!(touched, vec!["Animal00".to_string(), "Animal.1".to_string()]);
        system.commit().unwrap();

        let outcome = system.search(&[animal_type], &Query::All).await.unwrap();
        assert!(outcome.is_empty());
    }

    #[test]
    fn test_unknown_entity_rejected() {
        let system = build(SHARDED);
        let err = system.index(Document::new("Ghost", "1")).unwrap_err();
        assert!(matches!(
            err,
            ReplError::Store(StoreError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn test_invalid_config_fails_build() {
        let config = SearchConfig::from_toml_str(
            r#"
            [entities.Animal]
            shard_count = 0
            "#,
        )
        .unwrap();
        assert!(SearchSystem::build(&config).is_err());
    }

    #[tokio::test]
    async fn test_start_without_replicated_directories() {
        let system = build(SHARDED);
        assert_eq!(system.start(), 0);
        assert!(system.metrics().is_empty());
        system.shutdown().await;
    }
}
