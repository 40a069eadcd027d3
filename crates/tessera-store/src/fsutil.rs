//! Small filesystem helpers shared by the engine and the replication roles.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Suffix of files that are still being written.
pub const TMP_SUFFIX: &str = ".tmp";

/// Writes `bytes` to `path` so that readers see either the old or the new content.
///
/// The data goes to `<path>.tmp`, is fsynced, and is renamed over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::other(format!("not a file path: {}", path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(TMP_SUFFIX);
    let tmp = path.with_file_name(tmp_name);

    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Flushes directory metadata (new entries, renames) to disk.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Directory fsync is not available on this platform.
#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Whether a directory entry is an in-progress temporary file.
pub fn is_temporary(name: &str) -> bool {
    name.ends_with(TMP_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("current");

        write_atomic(&path, b"1\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1\n");

        write_atomic(&path, b"2\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "2\n");
        assert!(!dir.path().join("current.tmp").exists());
    }

    #[test]
    fn test_is_temporary() {
        assert!(is_temporary("segments.json.tmp"));
        assert!(!is_temporary("segments.json"));
    }
}
