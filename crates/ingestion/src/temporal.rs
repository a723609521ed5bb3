//! Folding hourly snapshots into one daily table.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{IngestionError, Result};
use crate::snapshot::GridSnapshot;

/// Column-oriented per-cell table. Missing values are NaN.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyTable {
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    /// Snapshot label per row; only set in the long diagnostic layout.
    pub time: Option<Vec<String>>,
    pub columns: BTreeMap<String, Vec<f64>>,
}

impl DailyTable {
    pub fn row_count(&self) -> usize {
        self.lat.len()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|c| c.as_slice())
    }

    /// Keep only rows where `keep` is true.
    pub fn retain_rows(&mut self, keep: &[bool]) {
        fn filter<T: Clone>(values: &[T], keep: &[bool]) -> Vec<T> {
            values
                .iter()
                .zip(keep)
                .filter(|(_, k)| **k)
                .map(|(v, _)| v.clone())
                .collect()
        }

        self.lat = filter(&self.lat, keep);
        self.lon = filter(&self.lon, keep);
        if let Some(time) = &self.time {
            self.time = Some(filter(time, keep));
        }
        for values in self.columns.values_mut() {
            *values = filter(values, keep);
        }
    }
}

/// Values of `name` in `snapshot` spread over `cells` cells.
///
/// Scalars broadcast; any other size mismatch yields all-missing.
fn aligned_values(snapshot: &GridSnapshot, name: &str, cells: usize) -> Option<Vec<f64>> {
    let values = snapshot.variables.get(name)?;
    if values.len() == cells {
        Some(values.clone())
    } else if values.len() == 1 {
        Some(vec![values[0]; cells])
    } else {
        None
    }
}

fn variable_names(snapshots: &[GridSnapshot], configured: &[String]) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = configured.iter().cloned().collect();
    for snapshot in snapshots {
        names.extend(snapshot.variables.keys().cloned());
    }
    names
}

/// Per-cell mean across snapshots, ignoring missing values.
///
/// The coordinate grid comes from the first snapshot. Every configured
/// variable gets a column even when no snapshot carries it.
pub fn reduce_daily_mean(snapshots: &[GridSnapshot], configured: &[String]) -> Result<DailyTable> {
    let first = snapshots
        .first()
        .ok_or_else(|| IngestionError::NoUsableSnapshot("empty snapshot list".to_string()))?;
    let (lat, lon) = first.mesh();
    let cells = lat.len();

    let mut columns = BTreeMap::new();
    for name in variable_names(snapshots, configured) {
        let mut sum = vec![0.0f64; cells];
        let mut count = vec![0u32; cells];

        for snapshot in snapshots {
            let Some(values) = aligned_values(snapshot, &name, cells) else {
                continue;
            };
            for (i, v) in values.into_iter().enumerate() {
                if !v.is_nan() {
                    sum[i] += v;
                    count[i] += 1;
                }
            }
        }

        let mean = sum
            .into_iter()
            .zip(count)
            .map(|(s, c)| if c == 0 { f64::NAN } else { s / f64::from(c) })
            .collect();
        columns.insert(name, mean);
    }

    Ok(DailyTable {
        lat,
        lon,
        time: None,
        columns,
    })
}

/// Every cell of every snapshot as its own row, labelled by snapshot.
///
/// Much larger than the daily mean; meant for inspecting raw inputs.
pub fn reduce_long(snapshots: &[GridSnapshot], configured: &[String]) -> Result<DailyTable> {
    let first = snapshots
        .first()
        .ok_or_else(|| IngestionError::NoUsableSnapshot("empty snapshot list".to_string()))?;
    let (mesh_lat, mesh_lon) = first.mesh();
    let cells = mesh_lat.len();
    let rows = cells * snapshots.len();
    let names = variable_names(snapshots, configured);

    let mut table = DailyTable {
        lat: Vec::with_capacity(rows),
        lon: Vec::with_capacity(rows),
        time: Some(Vec::with_capacity(rows)),
        columns: names
            .iter()
            .map(|n| (n.clone(), Vec::with_capacity(rows)))
            .collect(),
    };

    for snapshot in snapshots {
        table.lat.extend_from_slice(&mesh_lat);
        table.lon.extend_from_slice(&mesh_lon);
        if let Some(time) = table.time.as_mut() {
            time.extend(std::iter::repeat(snapshot.label.clone()).take(cells));
        }
        for (name, column) in table.columns.iter_mut() {
            match aligned_values(snapshot, name, cells) {
                Some(values) => column.extend(values),
                None => column.extend(std::iter::repeat(f64::NAN).take(cells)),
            }
        }
    }

    Ok(table)
}
