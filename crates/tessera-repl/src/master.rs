//! `filesystem-master`: a writable directory that publishes its commits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tessera_store::{
    DirectoryProvider, DirectoryProviderKind, DirectorySpec, DirectoryStatus, FsDocumentEngine,
    Generation, IndexSnapshot, IndexWriter, LiveIndex, StoreResult,
};
use tracing::{info, info_span, Span};

use crate::error::{ReplError, ReplResult};
use crate::publisher::{PublisherConfig, PublisherStats, SnapshotPublisher};
use crate::scheduler::RefreshTask;

#[derive(Debug)]
struct MasterShared {
    index: LiveIndex,
    publisher: SnapshotPublisher,
}

/// Live index at `index_base/<name>`, published to `source_base/<name>`.
#[derive(Debug)]
pub struct MasterDirectory {
    root: PathBuf,
    shared: Arc<MasterShared>,
    span: Span,
}

impl MasterDirectory {
    /// Opens the live index and its publish root.
    pub fn open(spec: &DirectorySpec, parent: &Span) -> ReplResult<Self> {
        let span = info_span!(parent: parent, "master", directory = %spec.name, role = "master");
        let root = spec.index_dir();
        let engine = FsDocumentEngine::open(&root)?;
        let publisher = SnapshotPublisher::open(
            PublisherConfig {
                name: spec.name.clone(),
                publish_root: spec.source_dir()?,
                retained_generations: spec.retained_generations,
            },
            &span,
        )?;
        span.in_scope(|| info!(root = %root.display(), "opened master directory"));
        Ok(Self {
            root,
            shared: Arc::new(MasterShared {
                index: LiveIndex::new(spec.name.clone(), Box::new(engine)),
                publisher,
            }),
            span,
        })
    }

    /// Publishes the committed state now.
    pub fn publish(&self) -> ReplResult<Generation> {
        self.shared.publisher.publish(&self.shared.index)
    }

    /// Publishes if anything was committed since the last generation.
    pub fn publish_if_changed(&self) -> ReplResult<Option<Generation>> {
        self.shared
            .publisher
            .publish_if_changed(&self.shared.index)
    }

    /// Publisher counters.
    pub fn publisher_stats(&self) -> PublisherStats {
        self.shared.publisher.stats()
    }

    /// `source_base/<name>`.
    pub fn publish_root(&self) -> &Path {
        self.shared.publisher.publish_root()
    }
}

impl DirectoryProvider for MasterDirectory {
    fn name(&self) -> &str {
        self.shared.index.name()
    }

    fn kind(&self) -> DirectoryProviderKind {
        DirectoryProviderKind::FilesystemMaster
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }

    fn open_reader(&self) -> StoreResult<Arc<IndexSnapshot>> {
        Ok(self.shared.index.reader())
    }

    fn writer(&self) -> StoreResult<IndexWriter<'_>> {
        Ok(self.shared.index.writer())
    }

    fn status(&self) -> DirectoryStatus {
        DirectoryStatus {
            name: self.shared.index.name().to_string(),
            kind: self.kind(),
            initialized: true,
            committed_version: Some(self.shared.index.committed_version()),
            generation: Some(self.shared.publisher.generation()),
        }
    }
}

#[async_trait]
impl RefreshTask for MasterDirectory {
    fn name(&self) -> &str {
        self.shared.index.name()
    }

    fn span(&self) -> &Span {
        &self.span
    }

    async fn tick(&self) -> ReplResult<()> {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.publisher.publish_if_changed(&shared.index))
            .await
            .map_err(ReplError::task_failed)?
            .map(|_| ())
    }
}
