//! Daily reanalysis archive ingestion.
//!
//! Turns a day's archive of hourly pollution grids into one cleaned table,
//! optionally aggregated to cities or provinces.
//!
//! # Pipeline
//!
//! ```text
//! archive ─► DatasetOpener ─► GridSnapshot* ─► reduce_daily_mean ─► DailyTable
//!        ─► filter_outliers ─► SpatialMapper ─► aggregate_by_admin ─► save_table
//! ```
//!
//! [`process_batch`] runs [`DayPipeline::process_one`] for every archive of
//! a year on a bounded worker pool. Backend opens are serialized process-wide
//! (see [`opener`]); every other stage runs in parallel across archives.

pub mod aggregate;
pub mod batch;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod opener;
pub mod outliers;
pub mod persist;
pub mod pipeline;
pub mod snapshot;
pub mod spatial;
pub mod temporal;

// Re-exports
pub use aggregate::{aggregate_by_admin, AdminAggregate, Granularity};
pub use batch::{discover_archives, process_batch, BatchOutcome, JobFailure, JobResult};
pub use cleanup::{CleanupTracker, DrainReport, InMemoryManifestStore, JsonFileStore, ManifestStore};
pub use config::{
    BatchConfig, Bounds, GroupKey, IngestConfig, MappingConfig, OpenerConfig, OutlierPolicy,
    ScriptRange, UnresolvedPolicy,
};
pub use error::{IngestionError, OpenError, Result};
pub use opener::{DatasetOpener, OpenedSnapshot, TempHandle};
pub use outliers::{filter_outliers, OutlierReport};
pub use persist::{save_table, OutputTable};
pub use pipeline::{day_label, DayPipeline};
pub use snapshot::GridSnapshot;
pub use spatial::{AdminLayer, AdminPolygonSource, MappedTable, SpatialMapper};
pub use temporal::{reduce_daily_mean, reduce_long, DailyTable};
