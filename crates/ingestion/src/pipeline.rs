//! Per-day pipeline: open, reduce, filter, map, aggregate, save.

use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::aggregate::{aggregate_by_admin, Granularity};
use crate::cleanup::CleanupTracker;
use crate::config::IngestConfig;
use crate::error::{IngestionError, Result};
use crate::opener::DatasetOpener;
use crate::outliers::filter_outliers;
use crate::persist::{save_table, OutputTable};
use crate::snapshot::{collect_from_archive, collect_from_dir, GridSnapshot};
use crate::spatial::{AdminPolygonSource, SpatialMapper};
use crate::temporal::{reduce_daily_mean, reduce_long, DailyTable};

/// Day label (`YYYYMMDD`) for an archive named `<prefix>YYYYMMDD.zip`.
///
/// The configured prefix is tried first. Names with any other prefix still
/// yield their trailing date. Anything else falls back to the file stem.
pub fn day_label(archive: &Path, prefix: &str) -> String {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let stem = name.strip_suffix(".zip").unwrap_or(name);

    let leading = stem
        .strip_prefix(prefix)
        .unwrap_or(stem)
        .get(..8)
        .filter(|d| is_date(d));
    let trailing = stem
        .len()
        .checked_sub(8)
        .and_then(|start| stem.get(start..))
        .filter(|d| is_date(d));

    leading.or(trailing).unwrap_or(stem).to_string()
}

fn is_date(digits: &str) -> bool {
    digits.bytes().all(|b| b.is_ascii_digit())
        && chrono::NaiveDate::parse_from_str(digits, "%Y%m%d").is_ok()
}

/// Runs the day pipeline for single archives or snapshot directories.
#[derive(Debug, Clone)]
pub struct DayPipeline {
    config: IngestConfig,
    opener: DatasetOpener,
}

impl DayPipeline {
    /// Build a pipeline sharing `tracker` with every other pipeline in the run.
    ///
    /// Fails with [`IngestionError::InvalidConfig`] when `config` does not
    /// validate.
    pub fn new(config: IngestConfig, tracker: CleanupTracker) -> Result<Self> {
        let opener = DatasetOpener::new(
            config.opener.clone(),
            config.snapshot_extension.clone(),
            tracker,
        );
        Self::with_opener(config, opener)
    }

    pub fn with_opener(config: IngestConfig, opener: DatasetOpener) -> Result<Self> {
        config.validate().map_err(IngestionError::InvalidConfig)?;
        Ok(Self { config, opener })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn opener(&self) -> &DatasetOpener {
        &self.opener
    }

    /// Process one daily archive and return the saved file.
    ///
    /// Admin granularities need `polygons`; without them, or when mapping
    /// fails, the grid table is saved instead.
    #[instrument(skip(self, polygons), fields(archive = %archive.display()))]
    pub fn process_one(
        &self,
        archive: &Path,
        granularity: Granularity,
        polygons: Option<&AdminPolygonSource>,
    ) -> Result<PathBuf> {
        let label = day_label(archive, &self.config.archive_prefix);
        let snapshots = collect_from_archive(&self.opener, archive, &self.config, &label)?;
        self.finish(&snapshots, &label, granularity, polygons)
    }

    /// Process a directory of already-extracted snapshot files.
    #[instrument(skip(self, polygons), fields(dir = %dir.display()))]
    pub fn process_snapshot_dir(
        &self,
        dir: &Path,
        granularity: Granularity,
        polygons: Option<&AdminPolygonSource>,
    ) -> Result<PathBuf> {
        let dir_label = day_label(dir, &self.config.archive_prefix);
        let snapshots = collect_from_dir(&self.opener, dir, &self.config, &dir_label)?;
        let label = if crate::persist::parse_day(&dir_label).is_some() {
            dir_label
        } else {
            first_snapshot_day(&snapshots).unwrap_or(dir_label)
        };
        self.finish(&snapshots, &label, granularity, polygons)
    }

    fn finish(
        &self,
        snapshots: &[GridSnapshot],
        label: &str,
        granularity: Granularity,
        polygons: Option<&AdminPolygonSource>,
    ) -> Result<PathBuf> {
        let mut table = if self.config.aggregate_mean {
            reduce_daily_mean(snapshots, &self.config.variables)?
        } else {
            reduce_long(snapshots, &self.config.variables)?
        };
        info!(snapshots = snapshots.len(), rows = table.row_count(), "Reduced day");

        let report = filter_outliers(&mut table, &self.config.bounds, &self.config.outliers);
        debug!(?report, "Filtered outliers");

        if granularity.is_admin() {
            match polygons {
                Some(source) => match self.aggregate(&table, granularity, source) {
                    Ok(output) => {
                        return save_table(&output, &self.config.output_dir, granularity, label);
                    }
                    Err(e) => {
                        warn!(error = %e, granularity = %granularity, "Admin mapping failed, saving grid table");
                    }
                },
                None => {
                    warn!(granularity = %granularity, "No polygon source, saving grid table");
                }
            }
        }

        save_table(
            &OutputTable::from_grid(&table),
            &self.config.output_dir,
            Granularity::Grid,
            label,
        )
    }

    fn aggregate(
        &self,
        table: &DailyTable,
        granularity: Granularity,
        source: &AdminPolygonSource,
    ) -> Result<OutputTable> {
        let layer = source.layer()?;
        let mapper = SpatialMapper::new(&layer, &self.config.mapping);
        let mapped = mapper.map_table(table.clone(), granularity.as_str())?;
        let aggregate = aggregate_by_admin(&mapped, granularity);
        info!(units = aggregate.row_count(), granularity = %granularity, "Aggregated by admin unit");
        Ok(OutputTable::from_aggregate(&aggregate))
    }
}

fn first_snapshot_day(snapshots: &[GridSnapshot]) -> Option<String> {
    let label = &snapshots.first()?.label;
    let date = chrono::NaiveDate::parse_from_str(label.get(..10)?, "%Y-%m-%d").ok()?;
    Some(date.format("%Y%m%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::OutlierPolicy;

    #[test]
    fn test_day_label() {
        let p = Path::new("/data/CN-Reanalysis20130105.zip");
        assert_eq!(day_label(p, "CN-Reanalysis"), "20130105");
        assert_eq!(day_label(Path::new("odd.zip"), "CN-Reanalysis"), "odd");
        assert_eq!(day_label(Path::new("/x/20130105_extra"), "CN-Reanalysis"), "20130105");
    }

    #[test]
    fn test_day_label_with_other_prefix() {
        assert_eq!(day_label(Path::new("/raw/PREFIX20130101.zip"), "CN-Reanalysis"), "20130101");
        assert_eq!(day_label(Path::new("CHAP_PM25_20150630.zip"), "CN-Reanalysis"), "20150630");
        // 8 trailing digits that are not a calendar date
        assert_eq!(day_label(Path::new("run12345678.zip"), "CN-Reanalysis"), "run12345678");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = IngestConfig::default();
        config.outliers = OutlierPolicy::GlobalPercentile {
            lower: 0.9,
            upper: 0.1,
        };
        let err = DayPipeline::new(config, CleanupTracker::in_memory()).unwrap_err();
        assert!(matches!(err, IngestionError::InvalidConfig(_)));

        let mut config = IngestConfig::default();
        config.mapping.coordinate_decimals = 15;
        assert!(DayPipeline::new(config, CleanupTracker::in_memory()).is_err());
    }
}
