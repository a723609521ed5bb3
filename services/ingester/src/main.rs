//! Daily reanalysis ingester.
//!
//! Processes every `<prefix>YYYYMMDD.zip` archive of one year under a root
//! directory and writes one table per day.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ingestion::{process_batch, AdminPolygonSource, CleanupTracker, DayPipeline, Granularity, IngestConfig};

#[derive(Parser, Debug)]
#[command(name = "ingester")]
#[command(about = "Ingest daily pollution reanalysis archives into per-day tables")]
struct Args {
    /// Directory holding the daily archives
    #[arg(long)]
    root: PathBuf,

    /// Year to process
    #[arg(long)]
    year: i32,

    /// Output granularity: grid, city or province
    #[arg(long, default_value = "grid")]
    granularity: Granularity,

    /// Admin polygon GeoJSON (required for city/province output)
    #[arg(long)]
    polygons: Option<PathBuf>,

    /// Concurrent archives (default: batch.workers from the config)
    #[arg(long)]
    workers: Option<usize>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Process one directory of extracted snapshots instead of a year of archives
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Log a heartbeat while the batch runs
    #[arg(long)]
    verbose: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Drain up to N entries from the cleanup manifest after the run
    #[arg(long)]
    drain_manifest: Option<usize>,
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn load_config(args: &Args) -> Result<IngestConfig> {
    let mut config = match &args.config {
        Some(path) => IngestConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => IngestConfig::default(),
    };
    if args.verbose {
        config.batch.verbose = true;
    }
    if let Some(workers) = args.workers {
        config.batch.workers = workers;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(&args.log_level))
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&args)?;
    info!(
        root = %args.root.display(),
        year = args.year,
        granularity = %args.granularity,
        workers = config.batch.workers,
        output = %config.output_dir.display(),
        "Starting ingester"
    );

    let polygons = args.polygons.as_ref().map(AdminPolygonSource::from_path);
    if args.granularity.is_admin() && polygons.is_none() {
        warn!(granularity = %args.granularity, "No --polygons given, days will be saved as grid");
    }

    let tracker = CleanupTracker::with_json_file(&config.opener.cleanup_manifest);
    let workers = config.batch.workers;
    let pipeline = DayPipeline::new(config, tracker.clone())?;

    if let Some(dir) = &args.snapshot_dir {
        match pipeline.process_snapshot_dir(dir, args.granularity, polygons.as_ref()) {
            Ok(path) => info!(path = %path.display(), "Saved day"),
            Err(e) => warn!(dir = %dir.display(), error = %e, "Snapshot directory failed"),
        }
    } else {
        let outcome = process_batch(
            &pipeline,
            &args.root,
            args.year,
            args.granularity,
            polygons.as_ref(),
            workers,
        )?;
        for failure in &outcome.failed {
            warn!(archive = %failure.archive.display(), error = %failure.error, "Failed archive");
        }
        info!(saved = outcome.saved.len(), failed = outcome.failed.len(), "Run finished");
    }

    if let Some(batch_size) = args.drain_manifest {
        let report = tracker.drain(batch_size)?;
        info!(deleted = report.deleted.len(), failed = report.failed.len(), "Drained manifest");
    }

    Ok(())
}
