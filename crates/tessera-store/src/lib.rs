#![warn(missing_docs)]

//! Tessera store subsystem: shard routing, directory providers and query fan-out
//!
//! This crate decides which physical directory a document belongs to, owns the
//! lifecycle of standalone and in-memory directories, and fans queries out
//! across every directory an entity type is spread over.

pub mod config;
pub mod directory;
pub mod document;
pub mod engine;
pub mod error;
pub mod fsutil;
pub mod router;
pub mod search;
pub mod sharding;
pub mod types;

pub use config::{
    DirectoryProviderKind, DirectorySettings, DirectorySpec, EntityConfig, EntityPlan,
    SearchConfig, ShardOverride,
};
pub use directory::{
    DirectoryProvider, DirectoryStatus, IndexWriter, LiveIndex, MemoryDirectory,
    StandaloneDirectory,
};
pub use document::{DocKey, Document, IndexSnapshot, Query};
pub use engine::{DocumentEngine, FsDocumentEngine, MemoryDocumentEngine};
pub use error::{StoreError, StoreResult};
pub use router::ShardRouter;
pub use search::{search_providers, SearchOutcome, ShardFailure, ShardHit};
pub use sharding::{
    shard_for_id, stable_hash, IdHashShardingStrategy, NotShardedStrategy, ShardingAlgorithm,
    ShardingConfig, ShardingStrategy,
};
pub use types::{EntityType, Generation, ShardId};
