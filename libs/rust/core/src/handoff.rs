//! Cross-process hand-off of the published storage URI.
//!
//! The record is a single line. Writes go to a temporary sibling and are renamed
//! into place under `<file>.lock` (created exclusively), so two overlapping
//! writers fail with [`HandoffError::Locked`]. Readers take no lock: the rename
//! means they see either the previous record or the new one, never a partial
//! line, and they work from a read-only directory.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::vault::StorageUri;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("hand-off file {0} not found; did the ingest stage run?")]
    Missing(PathBuf),
    #[error("hand-off file is locked by another run ({0}); remove it if that run is gone")]
    Locked(PathBuf),
    #[error("hand-off file {path} does not hold a storage URI: {content:?}")]
    Malformed { path: PathBuf, content: String },
    #[error("hand-off io error on {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
}

#[derive(Debug, Clone)]
pub struct HandoffFile { path: PathBuf }

struct LockGuard { path: PathBuf }

impl Drop for LockGuard {
    fn drop(&mut self) { let _ = fs::remove_file(&self.path); }
}

impl HandoffFile {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    pub fn path(&self) -> &Path { &self.path }

    pub fn exists(&self) -> bool { self.path.is_file() }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn lock(&self) -> Result<LockGuard, HandoffError> {
        let path = self.sibling(".lock");
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(LockGuard { path }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(HandoffError::Locked(path)),
            Err(source) => Err(HandoffError::Io { path, source }),
        }
    }

    /// Replace the record with `uri`.
    pub fn write(&self, uri: &StorageUri) -> Result<(), HandoffError> {
        let _guard = self.lock()?;
        let tmp = self.sibling(".tmp");
        let io = |source| HandoffError::Io { path: tmp.clone(), source };
        let mut file = fs::File::create(&tmp).map_err(io)?;
        writeln!(file, "{uri}").map_err(io)?;
        file.sync_all().map_err(io)?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(|source| HandoffError::Io { path: self.path.clone(), source })?;
        debug!(path = %self.path.display(), %uri, "handoff_written");
        Ok(())
    }

    /// Read the record. Checked before any registry connection is opened.
    pub fn read(&self) -> Result<StorageUri, HandoffError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(HandoffError::Missing(self.path.clone())),
            Err(source) => return Err(HandoffError::Io { path: self.path.clone(), source }),
        };
        content.trim().parse().map_err(|_| HandoffError::Malformed { path: self.path.clone(), content })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_exactly_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let handoff = HandoffFile::new(dir.path().join("model_uri.txt"));
        handoff.write(&StorageUri::new("old", "prefix")).unwrap();
        handoff.write(&StorageUri::new("private-models", "Qwen3-0.6B")).unwrap();
        let raw = fs::read_to_string(handoff.path()).unwrap();
        assert_eq!(raw.lines().collect::<Vec<_>>(), vec!["s3://private-models/Qwen3-0.6B"]);
        assert_eq!(handoff.read().unwrap(), StorageUri::new("private-models", "Qwen3-0.6B"));
        // neither the lock nor the temporary file survive
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let handoff = HandoffFile::new(dir.path().join("model_uri.txt"));
        assert!(matches!(handoff.read(), Err(HandoffError::Missing(_))));
    }

    #[test]
    fn held_lock_blocks_writers_only() {
        let dir = tempfile::tempdir().unwrap();
        let handoff = HandoffFile::new(dir.path().join("model_uri.txt"));
        handoff.write(&StorageUri::new("b", "p")).unwrap();
        let _held = handoff.lock().unwrap();
        assert!(matches!(handoff.write(&StorageUri::new("b", "q")), Err(HandoffError::Locked(_))));
        // concurrent readers still get the last complete record
        assert_eq!(handoff.read().unwrap(), StorageUri::new("b", "p"));
        assert_eq!(handoff.read().unwrap(), StorageUri::new("b", "p"));
    }

    #[test]
    fn read_leaves_no_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let handoff = HandoffFile::new(dir.path().join("model_uri.txt"));
        handoff.write(&StorageUri::new("private-models", "Qwen3-0.6B")).unwrap();
        handoff.read().unwrap();
        let names: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec![std::ffi::OsString::from("model_uri.txt")]);
    }

    #[test]
    fn reads_record_without_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_uri.txt");
        fs::write(&path, "s3://private-models/Qwen3-0.6B").unwrap();
        assert_eq!(HandoffFile::new(&path).read().unwrap().prefix, "Qwen3-0.6B");
    }

    #[test]
    fn garbage_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_uri.txt");
        fs::write(&path, "not a uri\n").unwrap();
        assert!(matches!(HandoffFile::new(&path).read(), Err(HandoffError::Malformed { .. })));
    }
}
