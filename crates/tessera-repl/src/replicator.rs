//! Slave-side snapshot adoption.
//!
//! Each tick compares the master's `current` marker with the last applied
//! generation. A newer generation is copied into a private staging directory,
//! verified against its manifest, renamed into place and then swapped in for
//! readers with a single pointer assignment. Failures never touch the active
//! generation.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tessera_store::engine::load_committed;
use tessera_store::{Generation, IndexSnapshot, StoreError, StoreResult};
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::error::{ReplError, ReplResult};
use crate::marker::{
    generation_dir, list_generations, list_staging, read_marker, write_marker, Manifest,
    MANIFEST_FILE, STAGING_PREFIX,
};
use crate::transfer::{remove_dir_if_exists, transfer_files, CancelFlag, TransferMode};

/// Where a replicator is in its tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorPhase {
    /// Waiting for the next tick.
    Idle,
    /// Reading the master's marker.
    Checking,
    /// Copying a generation into staging.
    Copying,
    /// Moving a verified copy into place.
    Swapping,
}

impl fmt::Display for ReplicatorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicatorPhase::Idle => "idle",
            ReplicatorPhase::Checking => "checking",
            ReplicatorPhase::Copying => "copying",
            ReplicatorPhase::Swapping => "swapping",
        };
        f.write_str(s)
    }
}

/// Result of a successful tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The master has not published anything yet.
    NothingPublished,
    /// The active generation already matches the marker.
    UpToDate(Generation),
    /// A new generation was adopted.
    Applied {
        /// Previously active generation (`ZERO` if none).
        from: Generation,
        /// Newly active generation.
        to: Generation,
    },
}

/// Replication bookkeeping of one slave directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationState {
    /// Generation readers currently see.
    pub last_applied_generation: Generation,
    /// When the last tick finished.
    pub last_attempt: Option<SystemTime>,
    /// Failed ticks since the last success.
    pub consecutive_failure_count: u32,
    /// Failed ticks since startup.
    pub total_failures: u64,
    /// Message of the last failure, cleared on success.
    pub last_error: Option<String>,
}

/// Replicator settings for one directory.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Directory name.
    pub name: String,
    /// Master's `source_base/<name>`.
    pub publish_root: PathBuf,
    /// Local `index_base/<name>`.
    pub local_root: PathBuf,
    /// Upper bound on one copy.
    pub copy_timeout: Duration,
}

/// Copies one published generation into a staging directory and loads it.
type CopyFn = fn(&Path, &Path, Generation, &CancelFlag) -> ReplResult<IndexSnapshot>;

#[derive(Debug)]
struct ActiveGeneration {
    generation: Generation,
    snapshot: Arc<IndexSnapshot>,
}

/// Keeps a local copy of one published directory current.
pub struct SnapshotReplicator {
    config: ReplicatorConfig,
    active: RwLock<Option<ActiveGeneration>>,
    state: Mutex<ReplicationState>,
    phase: Mutex<ReplicatorPhase>,
    tick_lock: tokio::sync::Mutex<()>,
    copy: CopyFn,
    span: Span,
}

impl fmt::Debug for SnapshotReplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotReplicator")
            .field("config", &self.config)
            .field("active_generation", &self.active_generation())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl SnapshotReplicator {
    /// Opens the local root, adopting the generation its marker points at if
    /// that copy is complete.
    pub fn open(config: ReplicatorConfig, parent: &Span) -> ReplResult<Self> {
        let span = info_span!(parent: parent, "replicator", directory = %config.name, role = "slave");
        fs::create_dir_all(&config.local_root)?;

        let adopted = span.in_scope(|| adopt_local(&config.local_root));
        let state = ReplicationState {
            last_applied_generation: adopted
                .as_ref()
                .map(|a| a.generation)
                .unwrap_or(Generation::ZERO),
            ..ReplicationState::default()
        };

        let replicator = Self {
            active: RwLock::new(adopted),
            state: Mutex::new(state),
            phase: Mutex::new(ReplicatorPhase::Idle),
            tick_lock: tokio::sync::Mutex::new(()),
            copy: copy_generation,
            config,
            span,
        };
        let keep = replicator.active_generation();
        replicator
            .span
            .in_scope(|| remove_stale(&replicator.config.local_root, keep));
        Ok(replicator)
    }

    #[cfg(test)]
    fn with_copy(mut self, copy: CopyFn) -> Self {
        self.copy = copy;
        self
    }

    /// Directory name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Local `index_base/<name>`.
    pub fn local_root(&self) -> &Path {
        &self.config.local_root
    }

    /// Master's `source_base/<name>`.
    pub fn publish_root(&self) -> &Path {
        &self.config.publish_root
    }

    /// Span every record of this replicator is emitted in.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Snapshot of the replication bookkeeping.
    pub fn state(&self) -> ReplicationState {
        self.state.lock().clone()
    }

    /// Current phase.
    pub fn phase(&self) -> ReplicatorPhase {
        *self.phase.lock()
    }

    /// Generation readers currently see, if any.
    pub fn active_generation(&self) -> Option<Generation> {
        self.active.read().as_ref().map(|a| a.generation)
    }

    /// Reader on the active generation.
    ///
    /// Fails with [`StoreError::NotYetInitialized`] until a generation has been adopted.
    pub fn reader(&self) -> StoreResult<Arc<IndexSnapshot>> {
        self.active
            .read()
            .as_ref()
            .map(|a| a.snapshot.clone())
            .ok_or_else(|| StoreError::NotYetInitialized {
                directory: self.config.name.clone(),
            })
    }

    /// Runs one check-copy-swap cycle.
    ///
    /// Ticks are serialized. A failure leaves the active generation as it was
    /// and is recorded in [`ReplicationState`].
    pub async fn tick(&self) -> ReplResult<TickOutcome> {
        let _serial = self.tick_lock.lock().await;
        let result = self.run_tick().instrument(self.span.clone()).await;
        self.set_phase(ReplicatorPhase::Idle);

        let mut state = self.state.lock();
        state.last_attempt = Some(SystemTime::now());
        match &result {
            Ok(outcome) => {
                state.consecutive_failure_count = 0;
                state.last_error = None;
                if let TickOutcome::Applied { to, .. } = outcome {
                    state.last_applied_generation = *to;
                }
            }
            Err(e) => {
                state.consecutive_failure_count += 1;
                state.total_failures += 1;
                state.last_error = Some(e.to_string());
                self.span.in_scope(|| {
                    warn!(
                        error = %e,
                        consecutive_failures = state.consecutive_failure_count,
                        transient = e.is_transient(),
                        "replication tick failed, serving last good generation"
                    )
                });
            }
        }
        result
    }

    fn set_phase(&self, phase: ReplicatorPhase) {
        *self.phase.lock() = phase;
    }

    async fn run_tick(&self) -> ReplResult<TickOutcome> {
        self.set_phase(ReplicatorPhase::Checking);
        self.clear_stale().await?;

        let publish_root = self.config.publish_root.clone();
        let Some(target) = self.blocking(move || read_marker(&publish_root)).await? else {
            debug!("nothing published yet");
            return Ok(TickOutcome::NothingPublished);
        };
        let current = self.active_generation();
        if current == Some(target) {
            debug!(generation = %target, "up to date");
            return Ok(TickOutcome::UpToDate(target));
        }
        if let Some(current) = current.filter(|c| *c > target) {
            warn!(active = %current, published = %target, "published generation went backwards, adopting it");
        }

        self.set_phase(ReplicatorPhase::Copying);
        let staging = self
            .config
            .local_root
            .join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4()));
        let snapshot = match self.copy_into_staging(target, &staging).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let discard = staging.clone();
                let discarded = self
                    .blocking(move || Ok(remove_dir_if_exists(&discard)?))
                    .await;
                if let Err(cleanup) = discarded {
                    warn!(path = %staging.display(), error = %cleanup, "could not discard staging copy");
                }
                return Err(e);
            }
        };

        self.set_phase(ReplicatorPhase::Swapping);
        let root = self.config.local_root.clone();
        self.blocking(move || place_generation(&root, &staging, target))
            .await?;
        let previous = self.active.write().replace(ActiveGeneration {
            generation: target,
            snapshot: Arc::new(snapshot),
        });
        let from = previous.map(|p| p.generation).unwrap_or(Generation::ZERO);
        info!(from = %from, to = %target, "adopted generation");

        if let Err(e) = self.clear_stale().await {
            warn!(error = %e, "cleanup after swap did not run, retrying next tick");
        }
        Ok(TickOutcome::Applied { from, to: target })
    }

    /// Runs filesystem work on the blocking pool, inside the current span.
    async fn blocking<T, F>(&self, job: F) -> ReplResult<T>
    where
        F: FnOnce() -> ReplResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let span = Span::current();
        tokio::task::spawn_blocking(move || span.in_scope(job))
            .await
            .map_err(ReplError::task_failed)?
    }

    async fn clear_stale(&self) -> ReplResult<()> {
        let root = self.config.local_root.clone();
        let keep = self.active_generation();
        self.blocking(move || {
            remove_stale(&root, keep);
            Ok(())
        })
        .await
    }

    async fn copy_into_staging(
        &self,
        target: Generation,
        staging: &Path,
    ) -> ReplResult<IndexSnapshot> {
        let source = generation_dir(&self.config.publish_root, target);
        let destination = staging.to_path_buf();
        let cancel = CancelFlag::new();
        let job_cancel = cancel.clone();
        let copy = self.copy;

        let job = self.blocking(move || copy(&source, &destination, target, &job_cancel));
        match tokio::time::timeout(self.config.copy_timeout, job).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(ReplError::CopyTimeout {
                    directory: self.config.name.clone(),
                    timeout: self.config.copy_timeout,
                })
            }
        }
    }
}

/// Moves a verified staging copy to `<generation>` and points the local marker at it.
fn place_generation(root: &Path, staging: &Path, target: Generation) -> ReplResult<()> {
    let final_dir = generation_dir(root, target);
    let placed = remove_dir_if_exists(&final_dir)
        .and_then(|()| fs::rename(staging, &final_dir))
        .and_then(|()| tessera_store::fsutil::sync_dir(root));
    if let Err(e) = placed {
        if let Err(cleanup) = remove_dir_if_exists(staging) {
            warn!(path = %staging.display(), error = %cleanup, "could not discard staging copy");
        }
        return Err(e.into());
    }
    write_marker(root, target)?;
    Ok(())
}

/// Removes staging leftovers and every generation under `root` but `keep`.
///
/// Open readers hold fully loaded snapshots, so old files can go at once.
fn remove_stale(root: &Path, keep: Option<Generation>) {
    let mut doomed = match list_staging(root) {
        Ok(staging) => staging,
        Err(e) => {
            warn!(error = %e, "could not list staging directories");
            Vec::new()
        }
    };
    match list_generations(root) {
        Ok(generations) => doomed.extend(
            generations
                .into_iter()
                .filter(|g| Some(*g) != keep)
                .map(|g| generation_dir(root, g)),
        ),
        Err(e) => warn!(error = %e, "could not list local generations"),
    }

    // A timed-out copy may still be writing into its staging directory; it
    // is picked up again on a later tick.
    for path in doomed {
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale copy"),
            Err(e) => warn!(path = %path.display(), error = %e, "removal failed, retrying next tick"),
        }
    }
}

/// Copies one published generation into `staging` and loads it.
fn copy_generation(
    source: &Path,
    staging: &Path,
    expected: Generation,
    cancel: &CancelFlag,
) -> ReplResult<IndexSnapshot> {
    let manifest = Manifest::read(source)?;
    if manifest.generation != expected {
        return Err(ReplError::ManifestMismatch {
            directory: source.display().to_string(),
            reason: format!(
                "manifest describes generation {}, marker says {}",
                manifest.generation, expected
            ),
        });
    }

    let mut names: Vec<String> = manifest.files.iter().map(|f| f.name.clone()).collect();
    names.push(MANIFEST_FILE.to_string());
    let bytes = transfer_files(source, staging, &names, TransferMode::Copy, cancel)?;
    manifest.verify(staging)?;
    let snapshot = load_committed(staging)?;
    debug!(
        generation = %expected,
        files = manifest.files.len(),
        bytes,
        docs = snapshot.num_docs(),
        "staging copy verified"
    );
    Ok(snapshot)
}

/// Loads the generation the local marker points at, if it is complete.
fn adopt_local(root: &Path) -> Option<ActiveGeneration> {
    let generation = match read_marker(root) {
        Ok(Some(g)) => g,
        Ok(None) => return None,
        Err(e) => {
            warn!(error = %e, "ignoring unreadable local marker");
            return None;
        }
    };
    let dir = generation_dir(root, generation);
    let loaded = Manifest::read(&dir)
        .and_then(|m| m.verify(&dir))
        .and_then(|()| load_committed(&dir).map_err(ReplError::from));
    match loaded {
        Ok(snapshot) => {
            info!(generation = %generation, docs = snapshot.num_docs(), "adopted local copy");
            Some(ActiveGeneration {
                generation,
                snapshot: Arc::new(snapshot),
            })
        }
        Err(e) => {
            warn!(generation = %generation, error = %e, "local copy incomplete, waiting for a fresh copy");
            None
        }
    }
}
