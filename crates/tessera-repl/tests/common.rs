//! Shared fixtures for replication integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tessera_repl::SearchSystem;
use tessera_store::{
    DirectoryProviderKind, DirectorySettings, Document, EntityConfig, EntityType, Query,
    SearchConfig,
};

pub const ENTITY: &str = "SnowStorm";

/// A master and a slave sharing one publish root, like two hosts on a shared volume.
pub struct MasterSlave {
    pub tmp: TempDir,
    pub master: SearchSystem,
    pub slave: SearchSystem,
}

impl MasterSlave {
    pub fn new(refresh_secs: u64) -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let master = SearchSystem::build(&config(
            DirectoryProviderKind::FilesystemMaster,
            tmp.path().join("master").join("main"),
            tmp.path().join("master").join("copy"),
            refresh_secs,
        ))
        .expect("master");
        let slave = SearchSystem::build(&config(
            DirectoryProviderKind::FilesystemSlave,
            tmp.path().join("slave"),
            tmp.path().join("master").join("copy"),
            refresh_secs,
        ))
        .expect("slave");
        Self { tmp, master, slave }
    }

    /// `source_base/<directory>`.
    pub fn publish_root(&self) -> PathBuf {
        self.tmp.path().join("master").join("copy").join(ENTITY)
    }

    pub fn index_and_commit(&self, id: &str, location: &str) {
        self.master.index(snow_storm(id, location)).expect("index");
        self.master.commit().expect("commit");
    }

    pub async fn slave_count(&self) -> Result<usize, String> {
        let outcome = self
            .slave
            .search(&[EntityType::new(ENTITY)], &Query::All)
            .await
            .map_err(|e| e.to_string())?;
        outcome
            .into_strict()
            .map(|docs| docs.len())
            .map_err(|e| e.to_string())
    }
}

pub fn config(
    kind: DirectoryProviderKind,
    index_base: PathBuf,
    source_base: PathBuf,
    refresh_secs: u64,
) -> SearchConfig {
    let mut entities = BTreeMap::new();
    entities.insert(ENTITY.to_string(), EntityConfig::default());
    SearchConfig {
        default: DirectorySettings {
            directory_provider: Some(kind),
            index_base: Some(index_base),
            source_base: Some(source_base),
            refresh_interval_secs: Some(refresh_secs),
            ..DirectorySettings::default()
        },
        entities,
    }
}

pub fn snow_storm(id: &str, location: &str) -> Document {
    Document::new(ENTITY, id)
        .with_field("location", location)
        .with_field("description", "Snow storm")
}

/// Removes one file of a published generation so copying it fails.
pub fn break_generation(publish_root: &Path, generation: u64) {
    let dir = publish_root.join(generation.to_string());
    std::fs::remove_file(dir.join("segments.json")).expect("remove segments.json");
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
