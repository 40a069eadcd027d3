#![warn(missing_docs)]

//! Tessera replication subsystem: master publication, slave adoption and refresh scheduling
//!
//! A master directory publishes its committed index as numbered, immutable
//! generations under a shared publish root. Slave directories poll the
//! publish root, copy newer generations into private staging directories and
//! swap them in for readers without blocking them.

pub mod error;
pub mod marker;
pub mod master;
pub mod metrics;
pub mod publisher;
pub mod registry;
pub mod replicator;
pub mod scheduler;
pub mod slave;
pub mod system;
pub mod transfer;

pub use error::{ReplError, ReplResult};
pub use marker::{FileEntry, Manifest, MANIFEST_FILE, MARKER_FILE};
pub use master::MasterDirectory;
pub use metrics::{format_prometheus, DirectoryMetrics, Metric, MetricKind};
pub use publisher::{PublisherConfig, PublisherStats, SnapshotPublisher};
pub use registry::{BuiltDirectory, ProviderFactory, ProviderRegistry};
pub use replicator::{
    ReplicationState, ReplicatorConfig, ReplicatorPhase, SnapshotReplicator, TickOutcome,
};
pub use scheduler::{RefreshScheduler, RefreshTask, SchedulerHandle, SchedulerStats};
pub use slave::SlaveDirectory;
pub use system::SearchSystem;
pub use transfer::{CancelFlag, TransferMode};
