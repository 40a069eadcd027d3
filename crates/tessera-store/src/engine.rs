//! Per-directory document engine.
//!
//! The engine buffers additions and deletions and makes them durable on
//! [`DocumentEngine::commit`]. The filesystem engine never modifies a file in
//! place: every commit writes a new immutable segment file and then atomically
//! replaces `segments.json`, which lists the live segments. A directory of such
//! files is therefore safe to hard-link or copy file by file while the engine
//! keeps committing.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::document::{DocKey, Document, IndexSnapshot};
use crate::error::{StoreError, StoreResult};
use crate::fsutil::write_atomic;
use crate::types::EntityType;

/// Name of the commit point file.
pub const SEGMENTS_FILE: &str = "segments.json";

/// The write-side contract of a per-directory document engine.
pub trait DocumentEngine: Send + fmt::Debug {
    /// Buffers a document, replacing any committed document with the same key.
    fn add(&mut self, doc: Document);

    /// Buffers the deletion of a single document.
    fn delete(&mut self, entity_type: &EntityType, id: &str);

    /// Buffers the deletion of every document of an entity type.
    fn delete_all(&mut self, entity_type: &EntityType);

    /// Makes buffered changes durable and returns the new commit version.
    ///
    /// Committing with nothing buffered is a no-op returning the current version.
    fn commit(&mut self) -> StoreResult<u64>;

    /// Version of the last successful commit (0 for a fresh index).
    fn committed_version(&self) -> u64;

    /// Whether there are buffered, uncommitted changes.
    fn has_pending(&self) -> bool;

    /// A snapshot of the last committed state.
    fn snapshot(&self) -> IndexSnapshot;

    /// On-disk location, if the engine persists anything.
    fn root(&self) -> Option<&Path>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentsFile {
    version: u64,
    segments: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Tombstone {
    Document { entity_type: EntityType, id: String },
    Entity { entity_type: EntityType },
}

/// One commit's worth of changes. Tombstones apply before documents.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Segment {
    version: u64,
    tombstones: Vec<Tombstone>,
    documents: Vec<Document>,
}

impl Segment {
    fn apply(&self, docs: &mut BTreeMap<DocKey, Document>) {
        for tombstone in &self.tombstones {
            match tombstone {
                Tombstone::Document { entity_type, id } => {
                    docs.remove(&DocKey {
                        entity_type: entity_type.clone(),
                        id: id.clone(),
                    });
                }
                Tombstone::Entity { entity_type } => {
                    docs.retain(|key, _| key.entity_type != *entity_type);
                }
            }
        }
        for doc in &self.documents {
            docs.insert(doc.key(), doc.clone());
        }
    }
}

#[derive(Debug, Default)]
struct PendingChanges {
    tombstones: Vec<Tombstone>,
    documents: BTreeMap<DocKey, Document>,
}

impl PendingChanges {
    fn add(&mut self, doc: Document) {
        self.documents.insert(doc.key(), doc);
    }

    fn delete(&mut self, entity_type: &EntityType, id: &str) {
        self.documents.remove(&DocKey {
            entity_type: entity_type.clone(),
            id: id.to_string(),
        });
        self.tombstones.push(Tombstone::Document {
            entity_type: entity_type.clone(),
            id: id.to_string(),
        });
    }

    fn delete_all(&mut self, entity_type: &EntityType) {
        self.documents.retain(|key, _| key.entity_type != *entity_type);
        self.tombstones.push(Tombstone::Entity {
            entity_type: entity_type.clone(),
        });
    }

    fn is_empty(&self) -> bool {
        self.tombstones.is_empty() && self.documents.is_empty()
    }

    fn to_segment(&self, version: u64) -> Segment {
        Segment {
            version,
            tombstones: self.tombstones.clone(),
            documents: self.documents.values().cloned().collect(),
        }
    }
}

fn segment_file_name(version: u64) -> String {
    format!("seg_{:010}.json", version)
}

fn corrupt(root: &Path, reason: impl Into<String>) -> StoreError {
    StoreError::CorruptIndex {
        directory: root.display().to_string(),
        reason: reason.into(),
    }
}

fn read_segments_file(root: &Path) -> StoreResult<Option<SegmentsFile>> {
    let path = root.join(SEGMENTS_FILE);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn load_documents(root: &Path, segments: &SegmentsFile) -> StoreResult<BTreeMap<DocKey, Document>> {
    let mut docs = BTreeMap::new();
    for name in &segments.segments {
        let bytes = fs::read(root.join(name))
            .map_err(|e| corrupt(root, format!("segment {} unreadable: {}", name, e)))?;
        let segment: Segment = serde_json::from_slice(&bytes)
            .map_err(|e| corrupt(root, format!("segment {} undecodable: {}", name, e)))?;
        segment.apply(&mut docs);
    }
    Ok(docs)
}

/// Whether `root` contains a committed index.
pub fn index_exists(root: &Path) -> bool {
    root.join(SEGMENTS_FILE).is_file()
}

/// Loads the committed state stored under `root`.
///
/// Fails with [`StoreError::CorruptIndex`] when there is no commit point or a
/// referenced segment is missing.
pub fn load_committed(root: &Path) -> StoreResult<IndexSnapshot> {
    let segments = read_segments_file(root)?
        .ok_or_else(|| corrupt(root, format!("missing {}", SEGMENTS_FILE)))?;
    let docs = load_documents(root, &segments)?;
    Ok(IndexSnapshot::new(segments.version, docs))
}

/// Filesystem-backed engine rooted at one directory.
#[derive(Debug)]
pub struct FsDocumentEngine {
    root: PathBuf,
    version: u64,
    segments: Vec<String>,
    committed: BTreeMap<DocKey, Document>,
    pending: PendingChanges,
}

impl FsDocumentEngine {
    /// Opens the index at `root`, creating an empty committed index first if
    /// none exists yet.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        Self::initialize(&root)?;
        let segments = read_segments_file(&root)?
            .ok_or_else(|| corrupt(&root, format!("missing {}", SEGMENTS_FILE)))?;
        let committed = load_documents(&root, &segments)?;
        debug!(
            root = %root.display(),
            version = segments.version,
            docs = committed.len(),
            "opened index"
        );
        Ok(Self {
            root,
            version: segments.version,
            segments: segments.segments,
            committed,
            pending: PendingChanges::default(),
        })
    }

    /// Creates an empty committed index at `root` unless one already exists.
    ///
    /// Returns true when a new index was created.
    pub fn initialize(root: &Path) -> StoreResult<bool> {
        fs::create_dir_all(root)?;
        if index_exists(root) {
            return Ok(false);
        }
        let empty = SegmentsFile {
            version: 0,
            segments: Vec::new(),
        };
        write_atomic(&root.join(SEGMENTS_FILE), &serde_json::to_vec_pretty(&empty)?)?;
        debug!(root = %root.display(), "initialized empty index");
        Ok(true)
    }
}

impl DocumentEngine for FsDocumentEngine {
    fn add(&mut self, doc: Document) {
        self.pending.add(doc);
    }

    fn delete(&mut self, entity_type: &EntityType, id: &str) {
        self.pending.delete(entity_type, id);
    }

    fn delete_all(&mut self, entity_type: &EntityType) {
        self.pending.delete_all(entity_type);
    }

    fn commit(&mut self) -> StoreResult<u64> {
        if self.pending.is_empty() {
            return Ok(self.version);
        }
        let version = self.version + 1;
        let segment = self.pending.to_segment(version);
        let name = segment_file_name(version);
        write_atomic(&self.root.join(&name), &serde_json::to_vec(&segment)?)?;

        let mut segments = self.segments.clone();
        segments.push(name);
        let commit_point = SegmentsFile { version, segments };
        write_atomic(
            &self.root.join(SEGMENTS_FILE),
            &serde_json::to_vec_pretty(&commit_point)?,
        )?;

        segment.apply(&mut self.committed);
        self.segments = commit_point.segments;
        self.version = version;
        self.pending = PendingChanges::default();
        debug!(root = %self.root.display(), version, "committed");
        Ok(version)
    }

    fn committed_version(&self) -> u64 {
        self.version
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot::new(self.version, self.committed.clone())
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

/// Engine keeping everything in memory.
#[derive(Debug, Default)]
pub struct MemoryDocumentEngine {
    version: u64,
    committed: BTreeMap<DocKey, Document>,
    pending: PendingChanges,
}

impl MemoryDocumentEngine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentEngine for MemoryDocumentEngine {
    fn add(&mut self, doc: Document) {
        self.pending.add(doc);
    }

    fn delete(&mut self, entity_type: &EntityType, id: &str) {
        self.pending.delete(entity_type, id);
    }

    fn delete_all(&mut self, entity_type: &EntityType) {
        self.pending.delete_all(entity_type);
    }

    fn commit(&mut self) -> StoreResult<u64> {
        if self.pending.is_empty() {
            return Ok(self.version);
        }
        self.version += 1;
        self.pending.to_segment(self.version).apply(&mut self.committed);
        self.pending = PendingChanges::default();
        Ok(self.version)
    }

    fn committed_version(&self) -> u64 {
        self.version
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot::new(self.version, self.committed.clone())
    }

    fn root(&self) -> Option<&Path> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Query;
    use tempfile::TempDir;

    fn animal(id: &str, name: &str) -> Document {
        Document::new("Animal", id).with_field("name", name)
    }

    #[test]
    fn test_open_initializes_empty_index() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("Animal.0");

        let engine = FsDocumentEngine::open(&root).unwrap();
        assert_eq!(engine.committed_version(), 0);
        assert!(index_exists(&root));
        assert_eq!(load_committed(&root).unwrap().num_docs(), 0);

        // A second initialize leaves the index alone.
        assert!(!FsDocumentEngine::initialize(&root).unwrap());
    }

    #[test]
    fn test_commit_persists_and_reopens() {
        let dir = TempDir::new().unwrap();
        let mut engine = FsDocumentEngine::open(dir.path()).unwrap();

        engine.add(animal("1", "Elephant"));
        engine.add(animal("2", "Bear"));
        assert!(engine.has_pending());
        assert_eq!(engine.commit().unwrap(), 1);
        assert!(!engine.has_pending());

        let reopened = FsDocumentEngine::open(dir.path()).unwrap();
        assert_eq!(reopened.committed_version(), 1);
        assert_eq!(reopened.snapshot().num_docs(), 2);
    }

    #[test]
    fn test_update_replaces_document() {
        let dir = TempDir::new().unwrap();
        let mut engine = FsDocumentEngine::open(dir.path()).unwrap();
        engine.add(animal("1", "Elephant"));
        engine.commit().unwrap();

        engine.delete(&EntityType::new("Animal"), "1");
        engine.add(animal("1", "Mouse"));
        engine.commit().unwrap();

        let snapshot = load_committed(dir.path()).unwrap();
        assert_eq!(snapshot.num_docs(), 1);
        assert_eq!(snapshot.search(&Query::term("name", "mouse")).len(), 1);
        assert!(snapshot.search(&Query::term("name", "elephant")).is_empty());
    }

    #[test]
    fn test_add_then_delete_in_same_commit() {
        let mut engine = MemoryDocumentEngine::new();
        engine.add(animal("1", "Elephant"));
        engine.delete(&EntityType::new("Animal"), "1");
        engine.commit().unwrap();
        assert_eq!(engine.snapshot().num_docs(), 0);
    }

    #[test]
    fn test_delete_all_only_touches_entity() {
        let dir = TempDir::new().unwrap();
        let mut engine = FsDocumentEngine::open(dir.path()).unwrap();
        engine.add(animal("1", "Elephant"));
        engine.add(Document::new("Furniture", "1").with_field("color", "dark blue"));
        engine.commit().unwrap();

        engine.delete_all(&EntityType::new("Animal"));
        engine.commit().unwrap();

        let snapshot = load_committed(dir.path()).unwrap();
        assert_eq!(snapshot.num_docs(), 1);
        assert!(snapshot.get(&EntityType::new("Furniture"), "1").is_some());
    }

    #[test]
    fn test_empty_commit_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut engine = FsDocumentEngine::open(dir.path()).unwrap();
        assert_eq!(engine.commit().unwrap(), 0);
        let files = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 1);
    }

    #[test]
    fn test_load_committed_missing_segment_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let mut engine = FsDocumentEngine::open(dir.path()).unwrap();
        engine.add(animal("1", "Elephant"));
        engine.commit().unwrap();
        fs::remove_file(dir.path().join(segment_file_name(1))).unwrap();

        let err = load_committed(dir.path()).unwrap_err();
        assert!(matches!(err, StoreError::CorruptIndex { .. }));
    }

    #[test]
    fn test_load_committed_without_commit_point() {
        let dir = TempDir::new().unwrap();
        let err = load_committed(dir.path()).unwrap_err();
        assert!(matches!(err, StoreError::CorruptIndex { .. }));
    }
}
