//! Writing day tables to disk.
//!
//! Parquet (SNAPPY) is preferred. If it cannot be written the same record
//! batch goes to CSV instead. Missing values are written as nulls either way.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray, UInt64Array};
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, NaiveDate};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::{debug, info, warn};

use crate::aggregate::{AdminAggregate, Granularity};
use crate::error::{IngestionError, Result};
use crate::temporal::DailyTable;

/// Output file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Parquet,
    Csv,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Parquet => "parquet",
            Self::Csv => "csv",
        }
    }
}

/// A column of an output table.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Text(Vec<Option<String>>),
    Float(Vec<f64>),
    Count(Vec<u64>),
}

impl Column {
    fn to_array(&self) -> ArrayRef {
        match self {
            Self::Text(values) => Arc::new(StringArray::from(values.clone())),
            Self::Float(values) => Arc::new(Float64Array::from(
                values
                    .iter()
                    .map(|v| if v.is_nan() { None } else { Some(*v) })
                    .collect::<Vec<_>>(),
            )),
            Self::Count(values) => Arc::new(UInt64Array::from(values.clone())),
        }
    }
}

/// Ordered named columns ready to be written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputTable {
    pub columns: Vec<(String, Column)>,
}

impl OutputTable {
    fn push(&mut self, name: &str, column: Column) {
        self.columns.push((name.to_string(), column));
    }

    /// One row per grid cell.
    pub fn from_grid(table: &DailyTable) -> Self {
        let mut out = Self::default();
        if let Some(time) = &table.time {
            out.push("time", Column::Text(time.iter().cloned().map(Some).collect()));
        }
        out.push("lat", Column::Float(table.lat.clone()));
        out.push("lon", Column::Float(table.lon.clone()));
        for (name, values) in &table.columns {
            out.push(name, Column::Float(values.clone()));
        }
        out
    }

    /// One row per admin unit.
    pub fn from_aggregate(agg: &AdminAggregate) -> Self {
        let mut out = Self::default();
        if let Some(time) = &agg.time {
            out.push("time", Column::Text(time.iter().cloned().map(Some).collect()));
        }
        out.push("province", Column::Text(agg.province.clone()));
        if let Some(city) = &agg.city {
            out.push("city", Column::Text(city.clone()));
        }
        out.push("admin_name", Column::Text(agg.admin_name.clone()));
        out.push(
            "admin_level",
            Column::Text(vec![Some(agg.admin_level.clone()); agg.row_count()]),
        );
        out.push("cells", Column::Count(agg.cells.clone()));
        for (name, values) in &agg.columns {
            out.push(name, Column::Float(values.clone()));
        }
        out
    }

    pub fn row_count(&self) -> usize {
        match self.columns.first() {
            Some((_, Column::Text(v))) => v.len(),
            Some((_, Column::Float(v))) => v.len(),
            Some((_, Column::Count(v))) => v.len(),
            None => 0,
        }
    }

    pub fn to_record_batch(&self) -> std::result::Result<RecordBatch, arrow::error::ArrowError> {
        RecordBatch::try_from_iter(
            self.columns
                .iter()
                .map(|(name, column)| (name.as_str(), column.to_array())),
        )
    }
}

/// Deterministic output path for a day, without extension.
///
/// `<root>/<granularity>/<YYYY>/<MM>/<DD>/<YYYYMMDD>`, or
/// `<root>/<granularity>/<label>` when the label is not a date.
pub fn output_stem(root: &Path, granularity: Granularity, day_label: &str) -> PathBuf {
    let base = root.join(granularity.as_str());
    match parse_day(day_label) {
        Some(date) => base
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(date.format("%Y%m%d").to_string()),
        None => base.join(day_label),
    }
}

/// Accepts `YYYYMMDD` or `YYYY-MM-DD`.
pub fn parse_day(label: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(label, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(label, "%Y-%m-%d"))
        .ok()
}

fn write_parquet(batch: &RecordBatch, path: &Path) -> std::result::Result<(), String> {
    let file = File::create(path).map_err(|e| e.to_string())?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).map_err(|e| e.to_string())?;
    writer.write(batch).map_err(|e| e.to_string())?;
    writer.close().map_err(|e| e.to_string())?;
    Ok(())
}

fn write_csv(batch: &RecordBatch, path: &Path) -> std::result::Result<(), String> {
    let file = File::create(path).map_err(|e| e.to_string())?;
    let mut writer = arrow::csv::WriterBuilder::new()
        .with_header(true)
        .build(file);
    writer.write(batch).map_err(|e| e.to_string())
}

fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale output"),
    }
}

/// Write `table` for one day, overwriting any previous output.
///
/// Exactly one file exists for (day, granularity) afterwards.
pub fn save_table(
    table: &OutputTable,
    output_dir: &Path,
    granularity: Granularity,
    day_label: &str,
) -> Result<PathBuf> {
    let stem = output_stem(output_dir, granularity, day_label);
    let persist_err = |reason: String| IngestionError::Persist {
        path: stem.display().to_string(),
        reason,
    };

    if let Some(parent) = stem.parent() {
        std::fs::create_dir_all(parent).map_err(|e| persist_err(e.to_string()))?;
    }

    let batch = table.to_record_batch().map_err(|e| persist_err(e.to_string()))?;
    let parquet_path = stem.with_extension(OutputFormat::Parquet.extension());
    let csv_path = stem.with_extension(OutputFormat::Csv.extension());

    let parquet_err = match write_parquet(&batch, &parquet_path) {
        Ok(()) => {
            remove_if_present(&csv_path);
            info!(path = %parquet_path.display(), rows = batch.num_rows(), "Saved day table");
            return Ok(parquet_path);
        }
        Err(e) => e,
    };

    warn!(path = %parquet_path.display(), error = %parquet_err, "Parquet write failed, falling back to CSV");
    remove_if_present(&parquet_path);

    match write_csv(&batch, &csv_path) {
        Ok(()) => {
            info!(path = %csv_path.display(), rows = batch.num_rows(), "Saved day table as CSV");
            Ok(csv_path)
        }
        Err(csv_err) => {
            remove_if_present(&csv_path);
            Err(persist_err(format!("parquet: {}; csv: {}", parquet_err, csv_err)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn grid() -> DailyTable {
        DailyTable {
            lat: vec![30.0, 31.0],
            lon: vec![110.0, 111.0],
            time: None,
            columns: BTreeMap::from([("pm25".to_string(), vec![12.5, f64::NAN])]),
        }
    }

    #[test]
    fn test_output_stem_layout() {
        let root = Path::new("/out");
        assert_eq!(
            output_stem(root, Granularity::City, "20130105"),
            PathBuf::from("/out/city/2013/01/05/20130105")
        );
        assert_eq!(
            output_stem(root, Granularity::Grid, "2013-01-05"),
            PathBuf::from("/out/grid/2013/01/05/20130105")
        );
        assert_eq!(
            output_stem(root, Granularity::Grid, "quick"),
            PathBuf::from("/out/grid/quick")
        );
    }

    #[test]
    fn test_record_batch_nulls() {
        let batch = OutputTable::from_grid(&grid()).to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 3);
        assert_eq!(batch.column(2).null_count(), 1);
    }

    #[test]
    fn test_save_parquet_and_remove_stale_csv() {
        let scratch = tempfile::tempdir().unwrap();
        let stem = output_stem(scratch.path(), Granularity::Grid, "20130101");
        std::fs::create_dir_all(stem.parent().unwrap()).unwrap();
        std::fs::write(stem.with_extension("csv"), "stale").unwrap();

        let path = save_table(&OutputTable::from_grid(&grid()), scratch.path(), Granularity::Grid, "20130101").unwrap();
        assert_eq!(path.extension().unwrap(), "parquet");
        assert!(path.exists());
        assert!(!stem.with_extension("csv").exists());
    }

    #[test]
    fn test_csv_fallback_when_parquet_unwritable() {
        let scratch = tempfile::tempdir().unwrap();
        let stem = output_stem(scratch.path(), Granularity::Grid, "20130101");
        let parquet_path = stem.with_extension("parquet");
        // a directory in place of the parquet file makes File::create fail
        std::fs::create_dir_all(&parquet_path).unwrap();

        let table = OutputTable::from_grid(&grid());
        let path = save_table(&table, scratch.path(), Granularity::Grid, "20130101").unwrap();
        assert_eq!(path, stem.with_extension("csv"));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "lat,lon,pm25");
        assert_eq!(lines.len(), 1 + table.row_count());
        assert!(lines[1].starts_with("30"));
        assert!(lines[2].ends_with(','));

        std::fs::remove_dir(&parquet_path).unwrap();
        let path = save_table(&table, scratch.path(), Granularity::Grid, "20130101").unwrap();
        assert_eq!(path, parquet_path);
        assert!(parquet_path.is_file());
        assert!(!stem.with_extension("csv").exists());
    }

    #[test]
    fn test_mismatched_columns_fail() {
        let scratch = tempfile::tempdir().unwrap();
        let table = OutputTable {
            columns: vec![
                ("a".to_string(), Column::Float(vec![1.0])),
                ("b".to_string(), Column::Float(vec![1.0, 2.0])),
            ],
        };
        let err = save_table(&table, scratch.path(), Granularity::Grid, "20130101").unwrap_err();
        assert!(matches!(err, IngestionError::Persist { .. }));
    }
}
