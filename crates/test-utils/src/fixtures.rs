//! Common fixtures: daily archives and admin polygon layers.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use zip::write::FileOptions;
use zip::ZipWriter;

use crate::generators::SnapshotCdl;

/// Archive prefix used throughout the tests.
pub const PREFIX: &str = "CN-Reanalysis";

/// Common 2x2 grid used by the end-to-end tests.
pub mod grid {
    pub const LAT: [f64; 2] = [30.0, 31.0];
    pub const LON: [f64; 2] = [110.0, 111.0];
}

/// Writes a zip archive with the given `(entry name, contents)` pairs.
pub fn write_zip(path: &Path, entries: &[(String, Vec<u8>)]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, contents) in entries {
        zip.start_file(name.as_str(), options)?;
        zip.write_all(contents)?;
    }
    zip.finish()?;
    Ok(())
}

/// Writes `<dir>/<PREFIX><day>.zip` holding one CDL snapshot per hour.
///
/// `hour_values(hour)` returns the row-major `pm25` grid for that hour.
pub fn write_daily_archive(
    dir: &Path,
    day: &str,
    lat: &[f64],
    lon: &[f64],
    hours: usize,
    hour_values: impl Fn(usize) -> Vec<f64>,
) -> std::io::Result<PathBuf> {
    let entries: Vec<(String, Vec<u8>)> = (0..hours)
        .map(|h| {
            let name = format!("{}{}{:02}", PREFIX, day, h);
            let text = SnapshotCdl::new(&name, lat.to_vec(), lon.to_vec())
                .variable("pm25", hour_values(h))
                .render();
            (format!("{}.nc", name), text.into_bytes())
        })
        .collect();

    let path = dir.join(format!("{}{}.zip", PREFIX, day));
    write_zip(&path, &entries)?;
    Ok(path)
}

/// Writes bytes that look like an archive name but are not a zip.
pub fn write_corrupt_archive(dir: &Path, day: &str) -> std::io::Result<PathBuf> {
    let path = dir.join(format!("{}{}.zip", PREFIX, day));
    std::fs::write(&path, b"PK\x03\x04 this is not really a zip archive")?;
    Ok(path)
}

/// Admin polygon layers as GeoJSON text.
pub mod polygons {
    /// Two provinces sharing the meridian `lon = 110.5`.
    ///
    /// The west square (109.5..110.5, 29.5..31.5) is Guangdong with Chinese
    /// names. The east square (110.5..111.5) is Guangxi whose Chinese names
    /// are placeholders, so English fallback applies.
    pub const TWO_PROVINCES: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {
      "type": "Feature",
      "properties": {"NAME_1": "Guangdong", "NL_NAME_1": "广东", "NAME_2": "Guangzhou", "NL_NAME_2": "广州"},
      "geometry": {"type": "Polygon", "coordinates": [[[109.5, 29.5], [110.5, 29.5], [110.5, 31.5], [109.5, 31.5], [109.5, 29.5]]]}
    },
    {
      "type": "Feature",
      "properties": {"NAME_1": "Guangxi", "NL_NAME_1": "NA", "NAME_2": "Nanning", "NL_NAME_2": null},
      "geometry": {"type": "Polygon", "coordinates": [[[110.5, 29.5], [111.5, 29.5], [111.5, 31.5], [110.5, 31.5], [110.5, 29.5]]]}
    }
  ]
}"#;

    /// A layer whose attributes carry no recognizable admin columns.
    pub const NO_ADMIN_COLUMNS: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {
      "type": "Feature",
      "properties": {"id": 7, "area": 12.5},
      "geometry": {"type": "Polygon", "coordinates": [[[100, 20], [120, 20], [120, 40], [100, 40], [100, 20]]]}
    }
  ]
}"#;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_daily_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_daily_archive(dir.path(), "20130101", &grid::LAT, &grid::LON, 3, |h| {
            vec![h as f64; 4]
        })
        .unwrap();
        assert!(path.ends_with("CN-Reanalysis20130101.zip"));

        let zip = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let mut names: Vec<_> = zip.file_names().collect();
        names.sort();
        assert_eq!(names[0], "CN-Reanalysis2013010100.nc");
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_corrupt_archive_is_not_zip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_corrupt_archive(dir.path(), "20130102").unwrap();
        assert!(zip::ZipArchive::new(File::open(path).unwrap()).is_err());
    }
}
