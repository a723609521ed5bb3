//! Hourly grid snapshots pulled out of opened datasets.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDateTime;
use netcdf_parser::{GridDataset, NetCdfError, Variable};
use tracing::{debug, warn};

use crate::config::IngestConfig;
use crate::error::{IngestionError, Result};
use crate::opener::DatasetOpener;

/// One hour of gridded values.
#[derive(Debug, Clone)]
pub struct GridSnapshot {
    /// `YYYY-MM-DD HH:00` when the entry name carries an hour, else the day.
    pub label: String,
    pub lat: Variable,
    pub lon: Variable,
    /// Configured variables present in this snapshot.
    pub variables: BTreeMap<String, Vec<f64>>,
}

impl GridSnapshot {
    /// Number of grid cells described by the coordinate arrays.
    pub fn cell_count(&self) -> usize {
        if self.is_axis_pair() {
            self.lat.len() * self.lon.len()
        } else {
            self.lat.len()
        }
    }

    /// Whether lat/lon are 1-D axes rather than per-cell arrays.
    pub fn is_axis_pair(&self) -> bool {
        self.lat.ndim() <= 1 && self.lon.ndim() <= 1
    }

    /// Per-cell coordinates, latitude outer when expanding 1-D axes.
    pub fn mesh(&self) -> (Vec<f64>, Vec<f64>) {
        if !self.is_axis_pair() {
            return (self.lat.values.clone(), self.lon.values.clone());
        }
        let n = self.cell_count();
        let mut lat = Vec::with_capacity(n);
        let mut lon = Vec::with_capacity(n);
        for &y in &self.lat.values {
            for &x in &self.lon.values {
                lat.push(y);
                lon.push(x);
            }
        }
        (lat, lon)
    }
}

/// Read the coordinate arrays and configured variables from a dataset.
pub fn extract_snapshot(dataset: &GridDataset, label: &str, variables: &[String]) -> Result<GridSnapshot> {
    let lat = read_first(dataset, &["lat2d", "lat"])?;
    let lon = read_first(dataset, &["lon2d", "lon"])?;

    if !(lat.ndim() <= 1 && lon.ndim() <= 1) && lat.len() != lon.len() {
        return Err(NetCdfError::InvalidFormat(format!(
            "lat has {} cells but lon has {}",
            lat.len(),
            lon.len()
        ))
        .into());
    }

    let mut values = BTreeMap::new();
    for name in variables {
        if !dataset.has_variable(name) {
            continue;
        }
        let var = dataset.variable(name)?;
        values.insert(name.clone(), var.values);
    }

    Ok(GridSnapshot {
        label: label.to_string(),
        lat,
        lon,
        variables: values,
    })
}

fn read_first(dataset: &GridDataset, names: &[&str]) -> Result<Variable> {
    for name in names {
        if dataset.has_variable(name) {
            return Ok(dataset.variable(name)?);
        }
    }
    Err(NetCdfError::MissingData(format!("coordinate {}", names.join("/"))).into())
}

/// Timestamp label for a snapshot named `<prefix>YYYYMMDDHH.<ext>`.
pub fn snapshot_label(entry: &str, prefix: &str, day_label: &str) -> String {
    let stem = Path::new(entry)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(entry);
    let stamp = stem.strip_prefix(prefix).unwrap_or(stem);

    stamp
        .get(..10)
        .and_then(|digits| NaiveDateTime::parse_from_str(&format!("{digits}00"), "%Y%m%d%H%M").ok())
        .map(|t| t.format("%Y-%m-%d %H:00").to_string())
        .unwrap_or_else(|| day_label.to_string())
}

/// Open and extract every snapshot in an archive.
///
/// Snapshots that fail to open or lack coordinates are skipped. Fails with
/// [`IngestionError::NoUsableSnapshot`] when nothing is left.
pub fn collect_from_archive(
    opener: &DatasetOpener,
    archive: &Path,
    config: &IngestConfig,
    day_label: &str,
) -> Result<Vec<GridSnapshot>> {
    let entries = opener.list_snapshots(archive)?;
    let mut snapshots = Vec::with_capacity(entries.len());

    for entry in &entries {
        let opened = match opener.open(archive, Some(entry)) {
            Ok(o) => o,
            Err(e) => {
                warn!(archive = %archive.display(), entry = %entry, error = %e, "Skipping snapshot");
                continue;
            }
        };
        let label = snapshot_label(entry, &config.archive_prefix, day_label);
        match extract_snapshot(&opened.dataset, &label, &config.variables) {
            Ok(s) => snapshots.push(s),
            Err(e) => warn!(archive = %archive.display(), entry = %entry, error = %e, "Skipping snapshot"),
        }
        // `opened.temp` drops here, releasing any extracted files.
    }

    debug!(archive = %archive.display(), entries = entries.len(), usable = snapshots.len(), "Collected snapshots");

    if snapshots.is_empty() {
        return Err(IngestionError::NoUsableSnapshot(archive.display().to_string()));
    }
    Ok(snapshots)
}

/// Open and extract every snapshot file in a directory.
pub fn collect_from_dir(
    opener: &DatasetOpener,
    dir: &Path,
    config: &IngestConfig,
    day_label: &str,
) -> Result<Vec<GridSnapshot>> {
    if !dir.is_dir() {
        return Err(IngestionError::NotFound(dir.display().to_string()));
    }

    let mut files: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| config.is_snapshot_name(n))
        })
        .collect();
    files.sort();

    let mut snapshots = Vec::with_capacity(files.len());
    for file in &files {
        let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let label = snapshot_label(name, &config.archive_prefix, day_label);
        let result = opener
            .open_file(file)
            .and_then(|ds| extract_snapshot(&ds, &label, &config.variables));
        match result {
            Ok(s) => snapshots.push(s),
            Err(e) => warn!(path = %file.display(), error = %e, "Skipping snapshot"),
        }
    }

    if snapshots.is_empty() {
        return Err(IngestionError::NoUsableSnapshot(dir.display().to_string()));
    }
    Ok(snapshots)
}
