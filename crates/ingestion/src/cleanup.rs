//! Tracking of temporary directories that could not be deleted right away.
//!
//! The manifest is a JSON array of paths shared by every worker in the
//! process and by whatever drains it later. [`CleanupTracker`] owns the only
//! lock around its read-modify-write cycle.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::error::{IngestionError, Result};

/// Persistence for the list of pending paths.
pub trait ManifestStore: Send + Sync {
    fn load(&self) -> Result<Vec<PathBuf>>;
    fn store(&self, entries: &[PathBuf]) -> Result<()>;
}

/// Manifest kept as a pretty-printed JSON array on disk.
///
/// Writes go to a sibling temporary file that is then persisted over the
/// target, so readers never see a half-written array.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ManifestStore for JsonFileStore {
    fn load(&self) -> Result<Vec<PathBuf>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            IngestionError::Manifest(format!("{}: {}", self.path.display(), e))
        })
    }

    fn store(&self, entries: &[PathBuf]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| IngestionError::Manifest(e.to_string()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|e| IngestionError::Manifest(format!("{}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

/// Manifest held in memory; for tests and short-lived runs.
#[derive(Debug, Default)]
pub struct InMemoryManifestStore {
    entries: Mutex<Vec<PathBuf>>,
}

impl InMemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ManifestStore for InMemoryManifestStore {
    fn load(&self) -> Result<Vec<PathBuf>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| IngestionError::Manifest("in-memory manifest poisoned".to_string()))?;
        Ok(entries.clone())
    }

    fn store(&self, entries: &[PathBuf]) -> Result<()> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| IngestionError::Manifest("in-memory manifest poisoned".to_string()))?;
        *guard = entries.to_vec();
        Ok(())
    }
}

/// Outcome of [`CleanupTracker::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Paths confirmed gone and removed from the manifest.
    pub deleted: Vec<PathBuf>,
    /// Paths that still exist; they stay in the manifest.
    pub failed: Vec<PathBuf>,
}

/// Resource-tracking service for temporary directories.
#[derive(Clone)]
pub struct CleanupTracker {
    store: Arc<dyn ManifestStore>,
    lock: Arc<Mutex<()>>,
}

impl CleanupTracker {
    pub fn new(store: Arc<dyn ManifestStore>) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Tracker backed by a JSON manifest file.
    pub fn with_json_file(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(JsonFileStore::new(path)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryManifestStore::new()))
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| IngestionError::Manifest("cleanup lock poisoned".to_string()))
    }

    /// Append `path` to the manifest unless it is already listed.
    pub fn record(&self, path: &Path) -> Result<()> {
        let _guard = self.guard()?;
        let mut entries = self.store.load()?;
        if !entries.iter().any(|p| p == path) {
            entries.push(path.to_path_buf());
            self.store.store(&entries)?;
            debug!(path = %path.display(), "Recorded path for deferred cleanup");
        }
        Ok(())
    }

    /// Delete `path` now; record it for later if deletion fails.
    ///
    /// Returns `true` if the path is gone.
    pub fn release(&self, path: &Path) -> bool {
        match remove_path(path) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Deferring cleanup of temporary path");
                if let Err(record_err) = self.record(path) {
                    warn!(
                        path = %path.display(),
                        error = %record_err,
                        "Failed to record temporary path in cleanup manifest"
                    );
                }
                false
            }
        }
    }

    /// Paths currently awaiting deletion, in recorded order.
    pub fn pending(&self) -> Result<Vec<PathBuf>> {
        let _guard = self.guard()?;
        self.store.load()
    }

    /// Try to delete up to `batch_size` entries, oldest first.
    ///
    /// Entries confirmed gone leave the manifest; the rest stay in place.
    pub fn drain(&self, batch_size: usize) -> Result<DrainReport> {
        let _guard = self.guard()?;
        let entries = self.store.load()?;
        let take = batch_size.min(entries.len());

        let mut report = DrainReport::default();
        let mut remaining = Vec::with_capacity(entries.len());

        for (i, path) in entries.into_iter().enumerate() {
            if i >= take {
                remaining.push(path);
                continue;
            }
            match remove_path(&path) {
                Ok(()) => report.deleted.push(path),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Manifest entry still present");
                    report.failed.push(path.clone());
                    remaining.push(path);
                }
            }
        }

        self.store.store(&remaining)?;
        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            remaining = remaining.len(),
            "Drained cleanup manifest"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for CleanupTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupTracker").finish_non_exhaustive()
    }
}

/// Remove a file or directory tree. A path that is already gone counts as
/// removed.
fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
