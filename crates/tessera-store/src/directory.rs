//! Directory providers: owners of one physical index and its lifecycle.
//!
//! A provider hands out readable snapshots and, for writable kinds, a writer
//! session. Readers never take the writer lock: every commit replaces the
//! readable snapshot behind an `Arc` in one assignment, so an open reader
//! keeps the state it opened while new readers see the new commit.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use crate::config::DirectoryProviderKind;
use crate::document::{Document, IndexSnapshot};
use crate::engine::{DocumentEngine, FsDocumentEngine, MemoryDocumentEngine};
use crate::error::StoreResult;
use crate::types::{EntityType, Generation};

/// Point-in-time description of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryStatus {
    /// Directory name.
    pub name: String,
    /// Provider kind.
    pub kind: DirectoryProviderKind,
    /// Whether readers can be opened.
    pub initialized: bool,
    /// Commit version visible to new readers.
    pub committed_version: Option<u64>,
    /// Published (master) or adopted (slave) generation, for replicated kinds.
    pub generation: Option<Generation>,
}

/// Owner of one physical index.
///
/// Two providers are the same directory when their names are equal.
pub trait DirectoryProvider: Send + Sync + fmt::Debug {
    /// Stable directory name, e.g. `Animal.1`.
    fn name(&self) -> &str;

    /// Provider kind.
    fn kind(&self) -> DirectoryProviderKind;

    /// Local on-disk root, if any.
    fn root(&self) -> Option<&Path> {
        None
    }

    /// Brings the directory into service.
    fn start(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Opens a reader on the latest locally visible state.
    fn open_reader(&self) -> StoreResult<Arc<IndexSnapshot>>;

    /// Opens a writer session. Sessions on one directory are serialized.
    fn writer(&self) -> StoreResult<IndexWriter<'_>>;

    /// Current status.
    fn status(&self) -> DirectoryStatus;

    /// Takes the directory out of service.
    fn stop(&self) {}
}

/// Writable index shared by the writable provider kinds.
pub struct LiveIndex {
    name: String,
    engine: Mutex<Box<dyn DocumentEngine>>,
    readable: RwLock<Arc<IndexSnapshot>>,
}

impl LiveIndex {
    /// Wraps an engine, exposing its committed state to readers.
    pub fn new(name: impl Into<String>, engine: Box<dyn DocumentEngine>) -> Self {
        let readable = Arc::new(engine.snapshot());
        Self {
            name: name.into(),
            engine: Mutex::new(engine),
            readable: RwLock::new(readable),
        }
    }

    /// Directory name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last committed snapshot.
    pub fn reader(&self) -> Arc<IndexSnapshot> {
        self.readable.read().clone()
    }

    /// Version of the last commit visible to readers.
    pub fn committed_version(&self) -> u64 {
        self.readable.read().version()
    }

    /// Opens a writer session, blocking while another session is open.
    pub fn writer(&self) -> IndexWriter<'_> {
        IndexWriter {
            directory: &self.name,
            engine: self.engine.lock(),
            readable: &self.readable,
        }
    }

    /// Holds off commits for the lifetime of the guard.
    ///
    /// Used to take a consistent copy of the committed files.
    pub fn hold_commits(&self) -> MutexGuard<'_, Box<dyn DocumentEngine>> {
        self.engine.lock()
    }
}

impl fmt::Debug for LiveIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveIndex")
            .field("name", &self.name)
            .field("committed_version", &self.committed_version())
            .finish()
    }
}

/// An exclusive write session on one directory.
///
/// Changes are buffered until [`IndexWriter::commit`]; uncommitted changes
/// stay buffered in the engine when the session ends.
pub struct IndexWriter<'a> {
    directory: &'a str,
    engine: MutexGuard<'a, Box<dyn DocumentEngine>>,
    readable: &'a RwLock<Arc<IndexSnapshot>>,
}

impl IndexWriter<'_> {
    /// Directory this session writes to.
    pub fn directory(&self) -> &str {
        self.directory
    }

    /// Adds or replaces a document.
    pub fn add(&mut self, doc: Document) {
        self.engine.add(doc);
    }

    /// Deletes a single document.
    pub fn delete(&mut self, entity_type: &EntityType, id: &str) {
        self.engine.delete(entity_type, id);
    }

    /// Deletes every document of an entity type.
    pub fn delete_all(&mut self, entity_type: &EntityType) {
        self.engine.delete_all(entity_type);
    }

    /// Commits buffered changes and exposes them to new readers.
    pub fn commit(&mut self) -> StoreResult<u64> {
        let version = self.engine.commit()?;
        if version != self.readable.read().version() {
            let snapshot = Arc::new(self.engine.snapshot());
            *self.readable.write() = snapshot;
            debug!(directory = self.directory, version, "new commit visible to readers");
        }
        Ok(version)
    }
}

/// `filesystem-standalone`: a plain on-disk index at `index_base/<name>`.
#[derive(Debug)]
pub struct StandaloneDirectory {
    root: PathBuf,
    index: LiveIndex,
}

impl StandaloneDirectory {
    /// Opens the directory, creating an empty index if none exists.
    pub fn open(name: impl Into<String>, root: impl Into<PathBuf>) -> StoreResult<Self> {
        let name = name.into();
        let root = root.into();
        let engine = FsDocumentEngine::open(&root)?;
        info!(directory = %name, root = %root.display(), "opened standalone directory");
        Ok(Self {
            index: LiveIndex::new(name, Box::new(engine)),
            root,
        })
    }
}

impl DirectoryProvider for StandaloneDirectory {
    fn name(&self) -> &str {
        self.index.name()
    }

    fn kind(&self) -> DirectoryProviderKind {
        DirectoryProviderKind::FilesystemStandalone
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }

    fn open_reader(&self) -> StoreResult<Arc<IndexSnapshot>> {
        Ok(self.index.reader())
    }

    fn writer(&self) -> StoreResult<IndexWriter<'_>> {
        Ok(self.index.writer())
    }

    fn status(&self) -> DirectoryStatus {
        DirectoryStatus {
            name: self.name().to_string(),
            kind: self.kind(),
            initialized: true,
            committed_version: Some(self.index.committed_version()),
            generation: None,
        }
    }
}

/// `in-memory`: a volatile index, mostly for tests.
#[derive(Debug)]
pub struct MemoryDirectory {
    index: LiveIndex,
}

impl MemoryDirectory {
    /// Creates an empty in-memory directory.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            index: LiveIndex::new(name, Box::new(MemoryDocumentEngine::new())),
        }
    }
}

impl DirectoryProvider for MemoryDirectory {
    fn name(&self) -> &str {
        self.index.name()
    }

    fn kind(&self) -> DirectoryProviderKind {
        DirectoryProviderKind::InMemory
    }

    fn open_reader(&self) -> StoreResult<Arc<IndexSnapshot>> {
        Ok(self.index.reader())
    }

    fn writer(&self) -> StoreResult<IndexWriter<'_>> {
        Ok(self.index.writer())
    }

    fn status(&self) -> DirectoryStatus {
        DirectoryStatus {
            name: self.name().to_string(),
            kind: self.kind(),
            initialized: true,
            committed_version: Some(self.index.committed_version()),
            generation: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Query;
    use tempfile::TempDir;

    #[test]
    fn test_reader_keeps_opened_state() {
        let dir = MemoryDirectory::new("Animal.0");
        {
            let mut writer = dir.writer().unwrap();
            writer.add(Document::new("Animal", "1").with_field("name", "Elephant"));
            writer.commit().unwrap();
        }
        let before = dir.open_reader().unwrap();

        {
            let mut writer = dir.writer().unwrap();
            writer.add(Document::new("Animal", "2").with_field("name", "Bear"));
            writer.commit().unwrap();
        }
        let after = dir.open_reader().unwrap();

        assert_eq!(before.num_docs(), 1);
        assert_eq!(after.num_docs(), 2);
    }

    #[test]
    fn test_uncommitted_changes_invisible() {
        let dir = MemoryDirectory::new("Animal.0");
        let mut writer = dir.writer().unwrap();
        writer.add(Document::new("Animal", "1"));
        drop(writer);
        assert_eq!(dir.open_reader().unwrap().num_docs(), 0);

        // Buffered changes survive the session and land with the next commit.
        dir.writer().unwrap().commit().unwrap();
        assert_eq!(dir.open_reader().unwrap().num_docs(), 1);
    }

    #[test]
    fn test_standalone_reopens_committed_state() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("Animal.1");
        {
            let dir = StandaloneDirectory::open("Animal.1", &root).unwrap();
            let mut writer = dir.writer().unwrap();
            writer.add(Document::new("Animal", "1").with_field("name", "Mouse"));
            assert_eq!(writer.commit().unwrap(), 1);
        }

        let dir = StandaloneDirectory::open("Animal.1", &root).unwrap();
        let reader = dir.open_reader().unwrap();
        assert_eq!(reader.search(&Query::term("name", "mouse")).len(), 1);

        let status = dir.status();
        assert_eq!(status.kind, DirectoryProviderKind::FilesystemStandalone);
        assert_eq!(status.committed_version, Some(1));
        assert!(status.initialized);
        assert_eq!(dir.root(), Some(root.as_path()));
    }
}
