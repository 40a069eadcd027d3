//! File transfer between index directories.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tessera_store::fsutil::sync_dir;
use tracing::trace;

use crate::error::{ReplError, ReplResult};

/// How files reach the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Hard-link, falling back to a copy (e.g. across filesystems).
    LinkOrCopy,
    /// Always copy.
    Copy,
}

/// Shared flag that stops a transfer between files.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn transfer_file(src: &Path, dst: &Path, mode: TransferMode) -> io::Result<u64> {
    if mode == TransferMode::LinkOrCopy {
        match fs::hard_link(src, dst) {
            Ok(()) => return Ok(fs::metadata(dst)?.len()),
            Err(e) => trace!(src = %src.display(), error = %e, "hard link failed, copying"),
        }
    }
    let copied = fs::copy(src, dst)?;
    fs::File::open(dst)?.sync_all()?;
    Ok(copied)
}

/// Transfers `names` from `src_dir` into `dst_dir`, returning the bytes moved.
///
/// `dst_dir` is created if needed and fsynced at the end. The cancel flag is
/// checked before each file.
pub fn transfer_files(
    src_dir: &Path,
    dst_dir: &Path,
    names: &[String],
    mode: TransferMode,
    cancel: &CancelFlag,
) -> ReplResult<u64> {
    fs::create_dir_all(dst_dir)?;
    let mut bytes = 0;
    for name in names {
        if cancel.is_cancelled() {
            return Err(ReplError::Cancelled);
        }
        bytes += transfer_file(&src_dir.join(name), &dst_dir.join(name), mode)?;
    }
    sync_dir(dst_dir)?;
    Ok(bytes)
}

/// Removes a directory tree; a missing directory is not an error.
pub fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
