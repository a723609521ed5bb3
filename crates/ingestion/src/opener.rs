//! Opening snapshots embedded in daily archives.
//!
//! # Strategy
//!
//! 1. Small entries are decoded straight from memory when a memory-capable
//!    backend exists and disk extraction is not forced.
//! 2. Otherwise the entry is extracted into a temporary directory next to the
//!    archive (system temp as fallback) and every available backend is tried
//!    in priority order.
//! 3. If every backend fails with a "cannot open" class error, the file is
//!    copied to a plain ASCII scratch path and the backends are tried again.
//! 4. Extracted files within the in-memory ceiling are loaded eagerly and
//!    their temporary directory is released at once.
//!
//! # Concurrency
//!
//! The decoding libraries are not safe for concurrent opens. Every backend
//! open in the process goes through [`BACKEND_OPEN_LOCK`]; nothing else in
//! the pipeline takes it, so reading and reducing already-open datasets stays
//! parallel across workers.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use netcdf_parser::{BackendRegistry, BackendStatus, GridDataset, NetCdfError};
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::cleanup::CleanupTracker;
use crate::config::OpenerConfig;
use crate::error::{IngestionError, OpenError, Result};

/// Serializes every backend open in the process.
static BACKEND_OPEN_LOCK: Mutex<()> = Mutex::new(());

/// Run `f` while holding the process-wide backend-open lock.
pub fn with_open_lock<T>(f: impl FnOnce() -> T) -> T {
    let _guard = BACKEND_OPEN_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    f()
}

/// Temporary files backing a lazily-read dataset.
///
/// Released on drop: deleted, or recorded in the cleanup manifest when
/// deletion fails or cleanup is deferred.
#[derive(Debug)]
pub struct TempHandle {
    paths: Vec<PathBuf>,
    tracker: CleanupTracker,
    defer: bool,
    released: bool,
}

impl TempHandle {
    fn new(paths: Vec<PathBuf>, tracker: CleanupTracker, defer: bool) -> Self {
        Self {
            paths,
            tracker,
            defer,
            released: false,
        }
    }

    /// The extraction directory (and scratch copy, if one was made).
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Release now instead of on drop. Returns `true` if everything is gone.
    pub fn release(mut self) -> bool {
        self.release_inner()
    }

    fn release_inner(&mut self) -> bool {
        if self.released {
            return true;
        }
        self.released = true;
        release_paths(&self.paths, &self.tracker, self.defer)
    }
}

impl Drop for TempHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn release_paths(paths: &[PathBuf], tracker: &CleanupTracker, defer: bool) -> bool {
    let mut all_gone = true;
    for path in paths {
        if defer {
            if let Err(e) = tracker.record(path) {
                warn!(path = %path.display(), error = %e, "Failed to record deferred cleanup");
            }
            all_gone = false;
        } else if !tracker.release(path) {
            all_gone = false;
        }
    }
    all_gone
}

/// An opened snapshot plus the temporary files it still reads from.
#[derive(Debug)]
pub struct OpenedSnapshot {
    pub entry: String,
    pub dataset: GridDataset,
    /// Present only when the dataset is still backed by extracted files.
    pub temp: Option<TempHandle>,
}

/// Backend attempts for one file.
#[derive(Debug, Default)]
struct Attempts {
    attempted: Vec<String>,
    errors: Vec<NetCdfError>,
}

impl Attempts {
    fn note(&mut self, backend: &str, err: NetCdfError) {
        if !self.attempted.iter().any(|a| a == backend) {
            self.attempted.push(backend.to_string());
        }
        self.errors.push(err);
    }

    fn all_not_found_class(&self) -> bool {
        !self.errors.is_empty() && self.errors.iter().all(|e| e.is_not_found_class())
    }

    fn into_error(self, entry: String, availability: Vec<BackendStatus>) -> OpenError {
        let last_error = self
            .errors
            .last()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no decoding backend available".to_string());
        OpenError {
            entry,
            attempted: self.attempted,
            last_error,
            availability,
        }
    }
}

/// Opens snapshot entries from archives or plain files.
#[derive(Debug, Clone)]
pub struct DatasetOpener {
    registry: BackendRegistry,
    config: OpenerConfig,
    tracker: CleanupTracker,
    snapshot_extension: String,
}

impl DatasetOpener {
    pub fn new(config: OpenerConfig, snapshot_extension: impl Into<String>, tracker: CleanupTracker) -> Self {
        Self {
            registry: BackendRegistry::with_defaults(),
            config,
            tracker,
            snapshot_extension: snapshot_extension.into(),
        }
    }

    pub fn with_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &CleanupTracker {
        &self.tracker
    }

    fn is_snapshot_name(&self, name: &str) -> bool {
        name.to_lowercase()
            .ends_with(&self.snapshot_extension.to_lowercase())
    }

    fn open_archive(&self, archive: &Path) -> Result<ZipArchive<File>> {
        if !archive.is_file() {
            return Err(IngestionError::NotFound(archive.display().to_string()));
        }
        let file = File::open(archive)?;
        ZipArchive::new(file).map_err(|e| IngestionError::InvalidArchive {
            path: archive.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Snapshot entry names in the archive, sorted.
    pub fn list_snapshots(&self, archive: &Path) -> Result<Vec<String>> {
        let zip = self.open_archive(archive)?;
        let mut names: Vec<String> = zip
            .file_names()
            .filter(|n| !n.ends_with('/') && self.is_snapshot_name(n))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Open one snapshot from `archive`; the first one when `entry` is `None`.
    pub fn open(&self, archive: &Path, entry: Option<&str>) -> Result<OpenedSnapshot> {
        let mut zip = self.open_archive(archive)?;

        let entry = match entry {
            Some(name) => name.to_string(),
            None => {
                let mut names: Vec<&str> = zip
                    .file_names()
                    .filter(|n| !n.ends_with('/') && self.is_snapshot_name(n))
                    .collect();
                names.sort();
                names
                    .first()
                    .map(|n| n.to_string())
                    .ok_or_else(|| {
                        IngestionError::NotFound(format!(
                            "no {} entry in {}",
                            self.snapshot_extension,
                            archive.display()
                        ))
                    })?
            }
        };

        let size = match zip.by_name(&entry) {
            Ok(f) => f.size(),
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(IngestionError::NotFound(format!(
                    "{} in {}",
                    entry,
                    archive.display()
                )))
            }
            Err(e) => return Err(invalid_archive(archive, e)),
        };

        if let Some(dataset) = self.try_in_memory(archive, &mut zip, &entry, size)? {
            return Ok(OpenedSnapshot {
                entry,
                dataset,
                temp: None,
            });
        }

        self.open_from_disk(archive, &mut zip, entry)
    }

    fn try_in_memory(
        &self,
        archive: &Path,
        zip: &mut ZipArchive<File>,
        entry: &str,
        size: u64,
    ) -> Result<Option<GridDataset>> {
        if self.config.force_disk || !self.config.within_ceiling(size) {
            return Ok(None);
        }
        let backends = self.registry.memory_capable();
        if backends.is_empty() {
            return Ok(None);
        }

        let bytes = read_entry(archive, zip, entry)?;
        for backend in backends {
            match with_open_lock(|| backend.open_bytes(&bytes, entry)) {
                Ok(dataset) => {
                    debug!(entry, backend = backend.name(), "Opened snapshot in memory");
                    return Ok(Some(dataset));
                }
                Err(e) => {
                    debug!(entry, backend = backend.name(), error = %e, "In-memory open failed");
                }
            }
        }
        Ok(None)
    }

    fn open_from_disk(
        &self,
        archive: &Path,
        zip: &mut ZipArchive<File>,
        entry: String,
    ) -> Result<OpenedSnapshot> {
        let (dir, file_path) = extract_verified(archive, zip, &entry, &self.tracker)?;
        let mut temp_paths = vec![dir];

        let mut attempts = Attempts::default();
        let mut opened = self.try_backends(&file_path, &mut attempts);
        let mut opened_path = file_path.clone();

        if opened.is_none() && attempts.all_not_found_class() {
            match copy_to_scratch(&file_path) {
                Ok(scratch) => {
                    debug!(entry = %entry, scratch = %scratch.display(), "Retrying from ASCII scratch path");
                    temp_paths.push(scratch.clone());
                    opened = self.try_backends(&scratch, &mut attempts);
                    opened_path = scratch;
                }
                Err(e) => warn!(entry = %entry, error = %e, "Failed to copy to scratch path"),
            }
        }

        let Some(dataset) = opened else {
            for path in &temp_paths {
                self.tracker.release(path);
            }
            return Err(attempts.into_error(entry, self.registry.availability()).into());
        };

        let file_size = std::fs::metadata(&opened_path).map(|m| m.len()).unwrap_or(u64::MAX);
        if dataset.is_materialized() || self.config.within_ceiling(file_size) {
            let loaded = dataset.load();
            release_paths(&temp_paths, &self.tracker, self.config.defer_cleanup);
            return Ok(OpenedSnapshot {
                entry,
                dataset: loaded?,
                temp: None,
            });
        }

        debug!(entry = %entry, size = file_size, "Keeping extracted snapshot on disk");
        Ok(OpenedSnapshot {
            entry,
            dataset,
            temp: Some(TempHandle::new(
                temp_paths,
                self.tracker.clone(),
                self.config.defer_cleanup,
            )),
        })
    }

    /// Open a snapshot that already lives on disk.
    ///
    /// Used for directories of extracted snapshots. The result is always
    /// materialized.
    pub fn open_file(&self, path: &Path) -> Result<GridDataset> {
        if !path.is_file() {
            return Err(IngestionError::NotFound(path.display().to_string()));
        }

        let mut attempts = Attempts::default();
        if let Some(dataset) = self.try_backends(path, &mut attempts) {
            return Ok(dataset.load()?);
        }

        if attempts.all_not_found_class() {
            let scratch = copy_to_scratch(path)?;
            let retried = self.try_backends(&scratch, &mut attempts).map(GridDataset::load);
            self.tracker.release(&scratch);
            if let Some(loaded) = retried {
                return Ok(loaded?);
            }
        }

        Err(attempts
            .into_error(path.display().to_string(), self.registry.availability())
            .into())
    }

    fn try_backends(&self, path: &Path, attempts: &mut Attempts) -> Option<GridDataset> {
        for backend in self.registry.available() {
            match with_open_lock(|| backend.open_path(path)) {
                Ok(dataset) => {
                    debug!(path = %path.display(), backend = backend.name(), "Opened snapshot");
                    return Some(dataset);
                }
                Err(e) => {
                    debug!(path = %path.display(), backend = backend.name(), error = %e, "Backend failed");
                    attempts.note(backend.name(), e);
                }
            }
        }
        None
    }
}

fn invalid_archive(archive: &Path, err: zip::result::ZipError) -> IngestionError {
    IngestionError::InvalidArchive {
        path: archive.display().to_string(),
        reason: err.to_string(),
    }
}

fn read_entry(archive: &Path, zip: &mut ZipArchive<File>, entry: &str) -> Result<Vec<u8>> {
    let mut file = zip.by_name(entry).map_err(|e| invalid_archive(archive, e))?;
    let mut bytes = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Extract `entry` into a fresh directory under `parent` and return the
/// directory and the extracted file.
fn extract_into(
    parent: Option<&Path>,
    archive: &Path,
    zip: &mut ZipArchive<File>,
    entry: &str,
    tracker: &CleanupTracker,
) -> Result<(PathBuf, PathBuf)> {
    let builder = {
        let mut b = tempfile::Builder::new();
        b.prefix(".nc_extract_");
        b
    };
    let dir = match parent {
        Some(p) => builder.tempdir_in(p)?,
        None => builder.tempdir()?,
    }
    .keep();

    let file_name = Path::new(entry)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "snapshot.nc".into());
    let target = dir.join(file_name);

    let result = (|| -> Result<()> {
        let mut src = zip.by_name(entry).map_err(|e| invalid_archive(archive, e))?;
        let mut out = File::create(&target)?;
        std::io::copy(&mut src, &mut out)?;
        Ok(())
    })();

    if let Err(e) = result {
        tracker.release(&dir);
        return Err(e);
    }
    Ok((dir, target))
}

/// Extract next to the archive, falling back to the system temp directory,
/// and retry once into a fresh system temp directory if the result cannot
/// be read back.
fn extract_verified(
    archive: &Path,
    zip: &mut ZipArchive<File>,
    entry: &str,
    tracker: &CleanupTracker,
) -> Result<(PathBuf, PathBuf)> {
    let colocated = archive.parent().filter(|p| !p.as_os_str().is_empty());
    let (dir, file) = match extract_into(colocated, archive, zip, entry, tracker) {
        Ok(extracted) => extracted,
        Err(e) => {
            debug!(entry, error = %e, "Colocated extraction failed, using system temp");
            extract_into(None, archive, zip, entry, tracker)?
        }
    };

    if is_readable(&file) {
        return Ok((dir, file));
    }

    warn!(entry, path = %file.display(), "Extracted snapshot unreadable, retrying in system temp");
    tracker.release(&dir);
    let (dir, file) = extract_into(None, archive, zip, entry, tracker)?;
    if !is_readable(&file) {
        tracker.release(&dir);
        return Err(IngestionError::FileRead(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("extracted {} is not readable", file.display()),
        )));
    }
    Ok((dir, file))
}

fn is_readable(path: &Path) -> bool {
    let mut head = [0u8; 8];
    File::open(path)
        .and_then(|mut f| f.read(&mut head))
        .is_ok()
}

/// Scratch directories keyed by volume, reused across retries.
fn scratch_dirs() -> &'static Mutex<HashMap<PathBuf, PathBuf>> {
    static DIRS: OnceLock<Mutex<HashMap<PathBuf, PathBuf>>> = OnceLock::new();
    DIRS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Root of the volume holding `path`: the drive prefix on Windows, the
/// system temp directory elsewhere.
fn volume_root(path: &Path) -> PathBuf {
    #[cfg(windows)]
    {
        use std::path::Component;
        if let Some(Component::Prefix(prefix)) = path.components().next() {
            let mut root = PathBuf::from(prefix.as_os_str());
            root.push(std::path::MAIN_SEPARATOR_STR);
            return root;
        }
    }
    let _ = path;
    std::env::temp_dir()
}

fn scratch_dir_for(path: &Path) -> std::io::Result<PathBuf> {
    let root = volume_root(path);
    let mut dirs = scratch_dirs().lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(dir) = dirs.get(&root) {
        if dir.is_dir() {
            return Ok(dir.clone());
        }
    }
    let dir = root.join("nc_scratch");
    std::fs::create_dir_all(&dir)?;
    dirs.insert(root, dir.clone());
    Ok(dir)
}

/// Copy `path` to a short plain-ASCII name in the volume's scratch directory.
fn copy_to_scratch(path: &Path) -> std::io::Result<PathBuf> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.is_ascii())
        .unwrap_or("nc");
    let name = format!(
        "scratch_{}_{}.{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed),
        ext
    );
    let target = scratch_dir_for(path)?.join(name);
    std::fs::copy(path, &target)?;
    info!(from = %path.display(), to = %target.display(), "Copied snapshot to scratch path");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use netcdf_parser::{CdlBackend, DecodeBackend, NetCdfResult};

    const SNAPSHOT: &str = "netcdf s {\ndimensions:\n\tlat = 1 ;\n\tlon = 2 ;\nvariables:\n\tfloat lat(lat) ;\n\tfloat lon(lon) ;\n\tfloat pm25(lat, lon) ;\ndata:\n lat = 30 ;\n lon = 110, 111 ;\n pm25 = 10, 20 ;\n}\n";

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in entries {
            zip.start_file(*name, zip::write::FileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn opener(config: OpenerConfig) -> DatasetOpener {
        DatasetOpener::new(config, ".nc", CleanupTracker::in_memory())
    }

    fn leftover_extract_dirs(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".nc_extract_"))
            .count()
    }

    #[test]
    fn test_in_memory_path() {
        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("day.zip");
        write_zip(&archive, &[("b.nc", SNAPSHOT.as_bytes()), ("a.nc", SNAPSHOT.as_bytes())]);

        let opened = opener(OpenerConfig::default()).open(&archive, None).unwrap();
        assert_eq!(opened.entry, "a.nc");
        assert!(opened.temp.is_none());
        assert_eq!(opened.dataset.backend(), "cdl");
        assert_eq!(leftover_extract_dirs(scratch.path()), 0);
    }

    #[test]
    fn test_disk_path_releases_temp_dir() {
        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("day.zip");
        write_zip(&archive, &[("x.nc", SNAPSHOT.as_bytes())]);

        let config = OpenerConfig {
            force_disk: true,
            ..OpenerConfig::default()
        };
        let opened = opener(config).open(&archive, Some("x.nc")).unwrap();
        assert!(opened.temp.is_none());
        assert!(opened.dataset.is_materialized());
        assert_eq!(opened.dataset.variable("pm25").unwrap().values, vec![10.0, 20.0]);
        assert_eq!(leftover_extract_dirs(scratch.path()), 0);
    }

    #[test]
    fn test_missing_entry_is_not_found() {
        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("day.zip");
        write_zip(&archive, &[("readme.txt", b"hi")]);

        let op = opener(OpenerConfig::default());
        assert!(matches!(op.open(&archive, None), Err(IngestionError::NotFound(_))));
        assert!(matches!(
            op.open(&archive, Some("nope.nc")),
            Err(IngestionError::NotFound(_))
        ));
        assert!(matches!(
            op.open(&scratch.path().join("absent.zip"), None),
            Err(IngestionError::NotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_archive() {
        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("bad.zip");
        std::fs::write(&archive, b"this is not a zip file").unwrap();
        assert!(matches!(
            opener(OpenerConfig::default()).open(&archive, None),
            Err(IngestionError::InvalidArchive { .. })
        ));
    }

    #[test]
    fn test_all_backends_fail_cleans_up() {
        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("day.zip");
        write_zip(&archive, &[("x.nc", b"\x89HDF\r\n\x1a\n not really")]);

        let registry = BackendRegistry::new(vec![Arc::new(CdlBackend)]);
        let op = opener(OpenerConfig::default()).with_registry(registry);
        let err = op.open(&archive, None).unwrap_err();

        match err {
            IngestionError::Open(open) => {
                assert_eq!(open.entry, "x.nc");
                assert_eq!(open.attempted, vec!["cdl"]);
                assert!(!open.last_error.is_empty());
                assert!(open.availability.iter().any(|s| s.name == "netcdf"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(leftover_extract_dirs(scratch.path()), 0);
        assert!(op.tracker().pending().unwrap().is_empty());
    }

    #[test]
    fn test_open_file_reports_attempts() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("CN-Reanalysis2013010100.nc");
        std::fs::write(&path, b"\x89HDF\r\n\x1a\n not really").unwrap();

        let registry = BackendRegistry::new(vec![Arc::new(CdlBackend)]);
        let err = opener(OpenerConfig::default())
            .with_registry(registry)
            .open_file(&path)
            .unwrap_err();

        match err {
            IngestionError::Open(open) => {
                assert_eq!(open.entry, path.display().to_string());
                assert_eq!(open.attempted, vec!["cdl"]);
                assert!(!open.last_error.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    struct PathSensitiveBackend;

    impl DecodeBackend for PathSensitiveBackend {
        fn name(&self) -> &'static str {
            "path-sensitive"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn open_path(&self, path: &Path) -> NetCdfResult<GridDataset> {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.starts_with("scratch_") {
                CdlBackend.open_path(path)
            } else {
                Err(NetCdfError::NotFound(path.display().to_string()))
            }
        }
    }

    #[test]
    fn test_not_found_class_retries_from_scratch() {
        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("day.zip");
        write_zip(&archive, &[("数据2013010100.nc", SNAPSHOT.as_bytes())]);

        let registry = BackendRegistry::new(vec![Arc::new(PathSensitiveBackend)]);
        let config = OpenerConfig {
            force_disk: true,
            ..OpenerConfig::default()
        };
        let opened = opener(config).with_registry(registry).open(&archive, None).unwrap();
        assert_eq!(opened.dataset.variable("pm25").unwrap().values, vec![10.0, 20.0]);
        assert!(opened.temp.is_none());
    }

    #[test]
    fn test_over_ceiling_keeps_temp_handle() {
        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("day.zip");
        write_zip(&archive, &[("x.nc", SNAPSHOT.as_bytes())]);

        let registry = BackendRegistry::new(vec![Arc::new(PathSensitiveBackend), Arc::new(LazyCdl)]);
        let config = OpenerConfig {
            max_in_memory_bytes: Some(4),
            ..OpenerConfig::default()
        };
        let opened = opener(config).with_registry(registry).open(&archive, None).unwrap();
        let temp = opened.temp.expect("lazy dataset keeps its directory");
        assert!(temp.paths()[0].exists());
        let dir = temp.paths()[0].clone();
        assert!(temp.release());
        assert!(!dir.exists());
    }

    /// CDL reader that reports itself as lazy.
    struct LazyCdl;

    struct LazyReader(GridDataset);

    impl netcdf_parser::DatasetReader for LazyReader {
        fn variable_names(&self) -> Vec<String> {
            self.0.variable_names()
        }

        fn read_variable(&self, name: &str) -> NetCdfResult<netcdf_parser::Variable> {
            self.0.variable(name)
        }
    }

    impl DecodeBackend for LazyCdl {
        fn name(&self) -> &'static str {
            "lazy-cdl"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn open_path(&self, path: &Path) -> NetCdfResult<GridDataset> {
            let inner = CdlBackend.open_path(path)?;
            Ok(GridDataset::new("lazy-cdl", path.display().to_string(), Box::new(LazyReader(inner))))
        }
    }
}
