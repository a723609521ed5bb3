//! Running the day pipeline over a year of archives.
//!
//! One job per archive on a bounded worker pool. Results come back over a
//! channel in completion order. Decode concurrency is further limited by the
//! opener's process-wide lock, so extra workers mostly overlap I/O with the
//! CPU-bound reduction and mapping stages.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use tracing::{debug, info, warn};

use crate::aggregate::Granularity;
use crate::error::{IngestionError, Result};
use crate::pipeline::DayPipeline;
use crate::spatial::AdminPolygonSource;

/// Outcome of one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub archive: PathBuf,
    /// Saved file, or the error text.
    pub outcome: std::result::Result<PathBuf, String>,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub archive: PathBuf,
    pub error: String,
}

/// Saved paths and failures of a batch, each in completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub saved: Vec<PathBuf>,
    pub failed: Vec<JobFailure>,
}

impl BatchOutcome {
    fn push(&mut self, result: JobResult) {
        match result.outcome {
            Ok(path) => self.saved.push(path),
            Err(error) => self.failed.push(JobFailure {
                archive: result.archive,
                error,
            }),
        }
    }

    pub fn total(&self) -> usize {
        self.saved.len() + self.failed.len()
    }
}

/// Archives named `<prefix>YYYYMMDD.zip` directly under `root`, in date order.
pub fn discover_archives(root: &Path, year: i32, prefix: &str) -> Vec<PathBuf> {
    let Some(first) = NaiveDate::from_ymd_opt(year, 1, 1) else {
        return Vec::new();
    };

    first
        .iter_days()
        .take_while(|d| d.year() == year)
        .map(|d| root.join(format!("{}{}.zip", prefix, d.format("%Y%m%d"))))
        .filter(|p| p.is_file())
        .collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_job(
    pipeline: &DayPipeline,
    archive: &Path,
    granularity: Granularity,
    polygons: Option<&AdminPolygonSource>,
) -> JobResult {
    let outcome = match catch_unwind(AssertUnwindSafe(|| {
        pipeline.process_one(archive, granularity, polygons)
    })) {
        Ok(Ok(path)) => Ok(path),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!("worker panicked: {}", panic_message(payload.as_ref()))),
    };
    JobResult {
        archive: archive.to_path_buf(),
        outcome,
    }
}

/// Logs completed/failed/total at a fixed interval until stopped.
struct Heartbeat {
    stop: mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl Heartbeat {
    fn start(
        interval: Duration,
        completed: Arc<AtomicUsize>,
        failed: Arc<AtomicUsize>,
        total: usize,
        workers: usize,
    ) -> std::io::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("ingest-heartbeat".to_string())
            .spawn(move || {
                while let Err(mpsc::RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    info!(
                        completed = completed.load(Ordering::Relaxed),
                        failed = failed.load(Ordering::Relaxed),
                        total,
                        workers,
                        "Heartbeat"
                    );
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("Heartbeat thread panicked");
        }
    }
}

/// Process every archive of `year` under `root`.
///
/// A failing archive only adds an entry to [`BatchOutcome::failed`]. The
/// returned error is reserved for the pool itself failing to start.
pub fn process_batch(
    pipeline: &DayPipeline,
    root: &Path,
    year: i32,
    granularity: Granularity,
    polygons: Option<&AdminPolygonSource>,
    workers: usize,
) -> Result<BatchOutcome> {
    let config = &pipeline.config().batch;
    let archives = discover_archives(root, year, &pipeline.config().archive_prefix);
    let total = archives.len();
    info!(root = %root.display(), year, total, workers, "Discovered archives");

    let mut outcome = BatchOutcome::default();
    if archives.is_empty() {
        return Ok(outcome);
    }

    if let Some(source) = polygons {
        match source.layer() {
            Ok(layer) => debug!(features = layer.features.len(), "Loaded admin polygons"),
            Err(e) => warn!(error = %e, "Admin polygons unavailable, days will be saved as grid"),
        }
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("ingest-worker-{}", i))
        .build()
        .map_err(|e| IngestionError::WorkerPool(e.to_string()))?;

    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let heartbeat = if config.verbose {
        match Heartbeat::start(
            Duration::from_secs(config.heartbeat_secs),
            completed.clone(),
            failed.clone(),
            total,
            workers,
        ) {
            Ok(h) => Some(h),
            Err(e) => {
                warn!(error = %e, "Failed to start heartbeat thread");
                None
            }
        }
    } else {
        None
    };

    let (tx, rx) = mpsc::channel::<JobResult>();
    pool.in_place_scope(|scope| {
        for archive in &archives {
            let tx = tx.clone();
            scope.spawn(move |_| {
                let result = run_job(pipeline, archive, granularity, polygons);
                let _ = tx.send(result);
            });
        }
        drop(tx);

        for result in rx {
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            match &result.outcome {
                Ok(path) => debug!(archive = %result.archive.display(), path = %path.display(), "Archive saved"),
                Err(e) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    warn!(archive = %result.archive.display(), error = %e, "Archive failed");
                }
            }
            outcome.push(result);

            if done % config.progress_every.max(1) == 0 && done < total {
                info!(completed = done, failed = outcome.failed.len(), total, "Batch progress");
            }
        }
    });

    if let Some(h) = heartbeat {
        h.stop();
    }

    info!(
        saved = outcome.saved.len(),
        failed = outcome.failed.len(),
        total,
        "Batch complete"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_archives_in_date_order() {
        let root = tempfile::tempdir().unwrap();
        for name in [
            "CN-Reanalysis20130301.zip",
            "CN-Reanalysis20130101.zip",
            "CN-Reanalysis20140101.zip",
            "CN-Reanalysis20130230.zip",
            "other20130102.zip",
        ] {
            std::fs::write(root.path().join(name), b"").unwrap();
        }

        let found = discover_archives(root.path(), 2013, "CN-Reanalysis");
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["CN-Reanalysis20130101.zip", "CN-Reanalysis20130301.zip"]);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }

    #[test]
    fn test_empty_root() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = DayPipeline::new(Default::default(), crate::cleanup::CleanupTracker::in_memory()).unwrap();
        let outcome = process_batch(&pipeline, root.path(), 2013, Granularity::Grid, None, 2).unwrap();
        assert_eq!(outcome.total(), 0);
    }
}
