//! Master-side snapshot publication.
//!
//! A publish captures the committed files of the live index into a staging
//! directory, seals it with a manifest, renames it to its generation number and
//! only then moves the `current` marker. A failure at any step leaves the
//! marker on the previous generation.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tessera_store::fsutil::sync_dir;
use tessera_store::{Generation, LiveIndex, StoreError};
use tracing::{debug, info, info_span, warn, Span};
use uuid::Uuid;

use crate::error::{ReplError, ReplResult};
use crate::marker::{
    generation_dir, list_generations, list_index_files, list_staging, read_marker, write_marker,
    Manifest, MARKER_FILE, STAGING_PREFIX,
};
use crate::transfer::{remove_dir_if_exists, transfer_files, CancelFlag, TransferMode};

/// Publisher settings for one directory.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Directory name.
    pub name: String,
    /// `source_base/<name>`.
    pub publish_root: PathBuf,
    /// Complete generations kept on disk.
    pub retained_generations: usize,
}

/// Counters and last outcome of a publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Generation the marker points at.
    pub generation: Generation,
    /// Commit version captured by that generation.
    pub published_version: Option<u64>,
    /// Successful publishes since startup.
    pub publish_count: u64,
    /// Failed publishes since startup.
    pub failure_count: u64,
    /// Message of the last failure, cleared on success.
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct PublisherState {
    stats: PublisherStats,
    /// Highest generation number ever used, including unreferenced leftovers.
    counter: Generation,
}

/// Owns the generation counter of one master directory.
#[derive(Debug)]
pub struct SnapshotPublisher {
    config: PublisherConfig,
    state: Mutex<PublisherState>,
    span: Span,
}

impl SnapshotPublisher {
    /// Opens the publish root, resuming the generation counter from what is on disk.
    pub fn open(config: PublisherConfig, parent: &Span) -> ReplResult<Self> {
        let span = info_span!(parent: parent, "publisher", directory = %config.name, role = "master");
        fs::create_dir_all(&config.publish_root)?;

        let marker = read_marker(&config.publish_root)?.unwrap_or(Generation::ZERO);
        let highest = list_generations(&config.publish_root)?
            .last()
            .copied()
            .unwrap_or(Generation::ZERO);
        let published_version = if marker.is_zero() {
            None
        } else {
            Manifest::read(&generation_dir(&config.publish_root, marker))
                .ok()
                .map(|m| m.commit_version)
        };

        span.in_scope(|| {
            info!(
                root = %config.publish_root.display(),
                generation = %marker,
                "opened publish root"
            )
        });

        let publisher = Self {
            state: Mutex::new(PublisherState {
                stats: PublisherStats {
                    generation: marker,
                    published_version,
                    ..PublisherStats::default()
                },
                counter: marker.max(highest),
            }),
            config,
            span,
        };
        publisher.span.in_scope(|| publisher.prune(marker));
        Ok(publisher)
    }

    /// Directory name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// `source_base/<name>`.
    pub fn publish_root(&self) -> &Path {
        &self.config.publish_root
    }

    /// Generation the marker currently points at.
    pub fn generation(&self) -> Generation {
        self.state.lock().stats.generation
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> PublisherStats {
        self.state.lock().stats.clone()
    }

    /// Publishes the committed state of `index` as a new generation.
    pub fn publish(&self, index: &LiveIndex) -> ReplResult<Generation> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        let Some(generation) = state.counter.next() else {
            let e = ReplError::MalformedMarker {
                path: self.config.publish_root.join(MARKER_FILE),
                content: state.counter.to_string(),
            };
            state.stats.failure_count += 1;
            state.stats.last_error = Some(e.to_string());
            warn!(error = %e, "generation numbers exhausted");
            return Err(e);
        };
        let staging = self
            .config
            .publish_root
            .join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4()));

        match self.publish_into(index, &staging, generation) {
            Ok(manifest) => {
                state.counter = generation;
                state.stats.generation = generation;
                state.stats.published_version = Some(manifest.commit_version);
                state.stats.publish_count += 1;
                state.stats.last_error = None;
                info!(
                    generation = %generation,
                    commit_version = manifest.commit_version,
                    files = manifest.files.len(),
                    bytes = manifest.total_bytes(),
                    "published generation"
                );
                self.prune(generation);
                Ok(generation)
            }
            Err(e) => {
                state.stats.failure_count += 1;
                state.stats.last_error = Some(e.to_string());
                warn!(generation = %generation, error = %e, "publish abandoned");
                match abandon(&self.config.publish_root, &staging, generation) {
                    Abandoned::Discarded => {}
                    Abandoned::Placed => state.counter = generation,
                    Abandoned::Visible => {
                        state.counter = generation;
                        state.stats.generation = generation;
                    }
                }
                Err(e)
            }
        }
    }

    /// Publishes only when `index` has commits the last generation does not carry.
    ///
    /// The first call after startup publishes unless the marker already holds
    /// the current commit version.
    pub fn publish_if_changed(&self, index: &LiveIndex) -> ReplResult<Option<Generation>> {
        let version = index.committed_version();
        if self.state.lock().stats.published_version == Some(version) {
            self.span
                .in_scope(|| debug!(commit_version = version, "nothing new to publish"));
            return Ok(None);
        }
        self.publish(index).map(Some)
    }

    fn publish_into(
        &self,
        index: &LiveIndex,
        staging: &Path,
        generation: Generation,
    ) -> ReplResult<Manifest> {
        let root = &self.config.publish_root;

        // Commits wait while the files are linked, so the set is consistent.
        let commit_version = {
            let engine = index.hold_commits();
            let source = engine.root().ok_or_else(|| {
                StoreError::config(format!(
                    "directory {} has no on-disk index to publish",
                    self.config.name
                ))
            })?;
            let names = list_index_files(source)?;
            transfer_files(
                source,
                staging,
                &names,
                TransferMode::LinkOrCopy,
                &CancelFlag::new(),
            )?;
            engine.committed_version()
        };

        let manifest = Manifest::build(staging, generation, commit_version)?;
        manifest.write(staging)?;
        sync_dir(staging)?;

        let target = generation_dir(root, generation);
        remove_dir_if_exists(&target)?;
        fs::rename(staging, &target)?;
        sync_dir(root)?;
        write_marker(root, generation)?;
        Ok(manifest)
    }

    /// Keeps the newest `retained_generations` generations up to `current` and
    /// removes everything else, including leftover staging directories.
    fn prune(&self, current: Generation) {
        let root = &self.config.publish_root;
        let generations = match list_generations(root) {
            Ok(g) => g,
            Err(e) => {
                warn!(error = %e, "could not list published generations");
                return;
            }
        };
        let keep: Vec<Generation> = generations
            .iter()
            .rev()
            .filter(|g| **g <= current)
            .take(self.config.retained_generations)
            .copied()
            .collect();

        let mut doomed: Vec<PathBuf> = generations
            .iter()
            .filter(|g| !keep.contains(g))
            .map(|g| generation_dir(root, *g))
            .collect();
        match list_staging(root) {
            Ok(staging) => doomed.extend(staging),
            Err(e) => warn!(error = %e, "could not list staging directories"),
        }

        for path in doomed {
            match fs::remove_dir_all(&path) {
                Ok(()) => debug!(path = %path.display(), "pruned"),
                Err(e) => warn!(path = %path.display(), error = %e, "prune failed, retrying next publish"),
            }
        }
    }
}

/// What is left of a publish that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abandoned {
    /// Nothing reached the generation slot.
    Discarded,
    /// The generation directory was renamed into place; its number is used up.
    Placed,
    /// The marker already names the generation, so it stays on disk.
    Visible,
}

/// Cleans up after a failed publish of `generation`.
///
/// Staging always goes. The generation directory is removed unless the marker
/// points at it, and its number is never handed out again once it existed.
fn abandon(root: &Path, staging: &Path, generation: Generation) -> Abandoned {
    if let Err(cleanup) = remove_dir_if_exists(staging) {
        warn!(path = %staging.display(), error = %cleanup, "could not remove abandoned staging");
    }

    let dir = generation_dir(root, generation);
    if !dir.exists() {
        return Abandoned::Discarded;
    }
    match read_marker(root) {
        Ok(Some(current)) if current == generation => {
            warn!(generation = %generation, "marker already names the abandoned generation, keeping it");
            Abandoned::Visible
        }
        _ => {
            if let Err(cleanup) = remove_dir_if_exists(&dir) {
                warn!(path = %dir.display(), error = %cleanup, "could not remove abandoned publish");
            }
            Abandoned::Placed
        }
    }
}
