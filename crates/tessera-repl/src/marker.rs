//! Generation layout on disk: the `current` marker and per-generation manifests.
//!
//! A publish root (and a slave's local root) looks like:
//!
//! ```text
//! <root>/current          "7\n", replaced atomically
//! <root>/6/               older complete generation
//! <root>/7/MANIFEST.json  written last into the generation directory
//! <root>/7/segments.json
//! <root>/7/seg_0000000007.json
//! <root>/.staging-<uuid>  in-progress copy, never referenced by `current`
//! ```

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tessera_store::fsutil::{is_temporary, write_atomic};
use tessera_store::Generation;

use crate::error::{ReplError, ReplResult};

/// File holding the latest complete generation.
pub const MARKER_FILE: &str = "current";

/// Manifest file inside each generation directory.
pub const MANIFEST_FILE: &str = "MANIFEST.json";

/// Prefix of in-progress copy directories.
pub const STAGING_PREFIX: &str = ".staging-";

/// Reads the generation recorded in `<root>/current`.
///
/// Returns `None` when nothing has been published yet.
pub fn read_marker(root: &Path) -> ReplResult<Option<Generation>> {
    let path = root.join(MARKER_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let generation = content
        .trim()
        .parse::<u64>()
        .map_err(|_| ReplError::MalformedMarker {
            path: path.clone(),
            content: content.clone(),
        })?;
    Ok(Some(Generation::new(generation)))
}

/// Atomically points `<root>/current` at `generation`.
pub fn write_marker(root: &Path, generation: Generation) -> io::Result<()> {
    write_atomic(&root.join(MARKER_FILE), format!("{}\n", generation).as_bytes())
}

/// Directory of one generation under `root`.
pub fn generation_dir(root: &Path, generation: Generation) -> PathBuf {
    root.join(generation.to_string())
}

/// Generation directories present under `root`, oldest first.
pub fn list_generations(root: &Path) -> io::Result<Vec<Generation>> {
    let mut generations = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(generations),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(g) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
            generations.push(Generation::new(g));
        }
    }
    generations.sort();
    Ok(generations)
}

/// Leftover staging directories under `root`.
pub fn list_staging(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut staging = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(staging),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let is_staging = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with(STAGING_PREFIX))
            .unwrap_or(false);
        if is_staging && entry.file_type()?.is_dir() {
            staging.push(entry.path());
        }
    }
    Ok(staging)
}

/// Index files of a directory: regular files, excluding temporaries and the manifest.
pub fn list_index_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if is_temporary(&name) || name == MANIFEST_FILE {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One file of a published generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// File name relative to the generation directory.
    pub name: String,
    /// Length in bytes.
    pub len: u64,
    /// Hex-encoded BLAKE3 digest of the contents.
    pub blake3: String,
}

impl FileEntry {
    /// Hashes `dir/name`.
    pub fn compute(dir: &Path, name: &str) -> io::Result<Self> {
        let mut file = File::open(dir.join(name))?;
        let mut hasher = blake3::Hasher::new();
        let len = io::copy(&mut file, &mut hasher)?;
        Ok(Self {
            name: name.to_string(),
            len,
            blake3: hasher.finalize().to_hex().to_string(),
        })
    }
}

/// Description of a complete generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Generation number.
    pub generation: Generation,
    /// Engine commit version captured by this generation.
    pub commit_version: u64,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Every index file in the generation.
    pub files: Vec<FileEntry>,
}

impl Manifest {
    /// Builds a manifest by hashing the index files already present in `dir`.
    pub fn build(dir: &Path, generation: Generation, commit_version: u64) -> io::Result<Self> {
        let files = list_index_files(dir)?
            .iter()
            .map(|name| FileEntry::compute(dir, name))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            generation,
            commit_version,
            created_at_ms: now_ms(),
            files,
        })
    }

    /// Reads `dir/MANIFEST.json`.
    pub fn read(dir: &Path) -> ReplResult<Self> {
        let bytes = fs::read(dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Writes `dir/MANIFEST.json` atomically.
    pub fn write(&self, dir: &Path) -> ReplResult<()> {
        write_atomic(&dir.join(MANIFEST_FILE), &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Total size of the listed files.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }

    /// Checks that `dir` holds exactly the listed files with matching contents.
    pub fn verify(&self, dir: &Path) -> ReplResult<()> {
        let mismatch = |reason: String| ReplError::ManifestMismatch {
            directory: dir.display().to_string(),
            reason,
        };

        let present = list_index_files(dir)?;
        let expected: Vec<&str> = self.files.iter().map(|f| f.name.as_str()).collect();
        if present.len() != expected.len() || present.iter().zip(&expected).any(|(a, b)| a != b) {
            return Err(mismatch(format!(
                "file set {:?} does not match manifest {:?}",
                present, expected
            )));
        }

        for expected in &self.files {
            let actual = FileEntry::compute(dir, &expected.name)?;
            if actual.len != expected.len {
                return Err(mismatch(format!(
                    "{}: length {} != {}",
                    expected.name, actual.len, expected.len
                )));
            }
            if actual.blake3 != expected.blake3 {
                return Err(mismatch(format!("{}: checksum differs", expected.name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_missing_means_nothing_published() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(read_marker(tmp.path()).unwrap(), None);
    }

    #[test]
    fn test_marker_write_then_read() {
        let tmp = TempDir::new().unwrap();
        write_marker(tmp.path(), Generation::new(7)).unwrap();
        assert_eq!(
            fs::read_to_string(tmp.path().join(MARKER_FILE)).unwrap(),
            "7\n"
        );
        assert_eq!(read_marker(tmp.path()).unwrap(), Some(Generation::new(7)));
        assert!(!tmp.path().join("current.tmp").exists());
    }

    #[test]
    fn test_malformed_marker() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(MARKER_FILE), "seven").unwrap();
        let err = read_marker(tmp.path()).unwrap_err();
        assert!(matches!(err, ReplError::MalformedMarker { .. }));
    }

    #[test]
    fn test_list_generations_sorted_numeric_only() {
        let tmp = TempDir::new().unwrap();
        for name in ["10", "2", "9", ".staging-abc", "notes"] {
            fs::create_dir(tmp.path().join(name)).unwrap();
        }
        fs::write(tmp.path().join("3"), b"a file, not a generation").unwrap();

        let generations = list_generations(tmp.path()).unwrap();
        assert_eq!(
            generations,
            vec![Generation::new(2), Generation::new(9), Generation::new(10)]
        );
        assert_eq!(list_staging(tmp.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_manifest_verify_detects_tampering() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        fs::write(dir.join("segments.json"), b"{\"version\":1}").unwrap();
        fs::write(dir.join("seg_0000000001.json"), b"payload").unwrap();
        fs::write(dir.join("segments.json.tmp"), b"ignored").unwrap();

        let manifest = Manifest::build(dir, Generation::new(1), 1).unwrap();
        assert_eq!(manifest.files.len(), 2);
        manifest.write(dir).unwrap();
        manifest.verify(dir).unwrap();
        assert_eq!(Manifest::read(dir).unwrap(), manifest);

        fs::write(dir.join("seg_0000000001.json"), b"PAYLOAD").unwrap();
        assert!(matches!(
            manifest.verify(dir),
            Err(ReplError::ManifestMismatch { .. })
        ));

        fs::remove_file(dir.join("seg_0000000001.json")).unwrap();
        assert!(matches!(
            manifest.verify(dir),
            Err(ReplError::ManifestMismatch { .. })
        ));
    }

    #[test]
    fn test_file_entry_hash_matches_blake3() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a"), b"hello").unwrap();
        let entry = FileEntry::compute(tmp.path(), "a").unwrap();
        assert_eq!(entry.len, 5);
        assert_eq!(entry.blake3, blake3::hash(b"hello").to_hex().to_string());
    }
}
