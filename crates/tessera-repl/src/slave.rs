//! `filesystem-slave`: a read-only directory fed by a [`SnapshotReplicator`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tessera_store::{
    DirectoryProvider, DirectoryProviderKind, DirectorySpec, DirectoryStatus, IndexSnapshot,
    IndexWriter, StoreError, StoreResult,
};
use tracing::Span;

use crate::error::ReplResult;
use crate::replicator::{ReplicationState, ReplicatorConfig, SnapshotReplicator, TickOutcome};
use crate::scheduler::RefreshTask;

/// Read-only copy of a master directory.
#[derive(Debug)]
pub struct SlaveDirectory {
    replicator: SnapshotReplicator,
}

impl SlaveDirectory {
    /// Opens the local copy under `index_base/<name>`.
    pub fn open(spec: &DirectorySpec, parent: &Span) -> ReplResult<Self> {
        let replicator = SnapshotReplicator::open(
            ReplicatorConfig {
                name: spec.name.clone(),
                publish_root: spec.source_dir()?,
                local_root: spec.index_dir(),
                copy_timeout: spec.copy_timeout,
            },
            parent,
        )?;
        Ok(Self { replicator })
    }

    /// Runs one replication tick now.
    pub async fn sync(&self) -> ReplResult<TickOutcome> {
        self.replicator.tick().await
    }

    /// Replication bookkeeping.
    pub fn replication_state(&self) -> ReplicationState {
        self.replicator.state()
    }

    /// The underlying replicator.
    pub fn replicator(&self) -> &SnapshotReplicator {
        &self.replicator
    }
}

impl DirectoryProvider for SlaveDirectory {
    fn name(&self) -> &str {
        self.replicator.name()
    }

    fn kind(&self) -> DirectoryProviderKind {
        DirectoryProviderKind::FilesystemSlave
    }

    fn root(&self) -> Option<&Path> {
        Some(self.replicator.local_root())
    }

    fn open_reader(&self) -> StoreResult<Arc<IndexSnapshot>> {
        self.replicator.reader()
    }

    fn writer(&self) -> StoreResult<IndexWriter<'_>> {
        Err(StoreError::ReadOnly {
            directory: self.replicator.name().to_string(),
        })
    }

    fn status(&self) -> DirectoryStatus {
        let reader = self.replicator.reader().ok();
        DirectoryStatus {
            name: self.replicator.name().to_string(),
            kind: self.kind(),
            initialized: reader.is_some(),
            committed_version: reader.map(|r| r.version()),
            generation: self.replicator.active_generation(),
        }
    }
}

#[async_trait]
impl RefreshTask for SlaveDirectory {
    fn name(&self) -> &str {
        self.replicator.name()
    }

    fn span(&self) -> &Span {
        self.replicator.span()
    }

    async fn tick(&self) -> ReplResult<()> {
        self.replicator.tick().await.map(|_| ())
    }
}
