//! End-to-end tests for the day pipeline over synthetic CDL archives.

use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::array::{Array, Float64Array, StringArray, UInt64Array};
use arrow::record_batch::RecordBatch;
use ingestion::{
    AdminLayer, AdminPolygonSource, CleanupTracker, DayPipeline, Granularity, IngestConfig,
    IngestionError, OutlierPolicy,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use test_utils::{
    assert_approx_eq, create_constant_grid, create_grid_with_nans, grid, hourly_cycle, polygons,
    write_daily_archive, write_zip, CoordinateLayout, SnapshotCdl, FILL_VALUE,
};

/// Cell `i` at hour `h` holds `10 * (i + 1) + h`.
fn hourly_pm25(h: usize) -> Vec<f64> {
    (0..4).map(|i| 10.0 * (i as f64 + 1.0) + h as f64).collect()
}

fn config(out: &Path) -> IngestConfig {
    IngestConfig {
        output_dir: out.to_path_buf(),
        ..IngestConfig::default()
    }
}

fn read_parquet(path: &Path) -> RecordBatch {
    let file = File::open(path).unwrap();
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap();
    let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
    assert_eq!(batches.len(), 1);
    batches.into_iter().next().unwrap()
}

fn floats(batch: &RecordBatch, name: &str) -> Vec<Option<f64>> {
    let column = batch.column_by_name(name).unwrap();
    let array = column.as_any().downcast_ref::<Float64Array>().unwrap();
    (0..array.len())
        .map(|i| (!array.is_null(i)).then(|| array.value(i)))
        .collect()
}

fn strings(batch: &RecordBatch, name: &str) -> Vec<Option<String>> {
    let column = batch.column_by_name(name).unwrap();
    let array = column.as_any().downcast_ref::<StringArray>().unwrap();
    (0..array.len())
        .map(|i| (!array.is_null(i)).then(|| array.value(i).to_string()))
        .collect()
}

fn extract_dirs(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".nc_extract_"))
        .map(|e| e.path())
        .collect()
}

#[test]
fn test_daily_mean_grid_output() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let archive =
        write_daily_archive(input.path(), "20130101", &grid::LAT, &grid::LON, 24, hourly_pm25).unwrap();

    let pipeline = DayPipeline::new(config(out.path()), CleanupTracker::in_memory()).unwrap();
    let saved = pipeline.process_one(&archive, Granularity::Grid, None).unwrap();

    assert_eq!(saved, out.path().join("grid/2013/01/01/20130101.parquet"));
    let batch = read_parquet(&saved);
    assert_eq!(batch.num_rows(), 4);

    let pm25 = floats(&batch, "pm25");
    for (i, value) in pm25.iter().enumerate() {
        // mean of 10(i+1) + h over h = 0..24
        assert_approx_eq!(value.unwrap(), 10.0 * (i as f64 + 1.0) + 11.5, 1e-9);
    }

    assert_eq!(floats(&batch, "lat"), vec![Some(30.0), Some(30.0), Some(31.0), Some(31.0)]);
    assert_eq!(floats(&batch, "lon"), vec![Some(110.0), Some(111.0), Some(110.0), Some(111.0)]);

    // configured variables absent from every snapshot are all-null columns
    assert_eq!(floats(&batch, "so2"), vec![None; 4]);
    assert!(extract_dirs(input.path()).is_empty());
}

#[test]
fn test_missing_hours_are_ignored_not_zeroed() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let archive = write_daily_archive(input.path(), "20130102", &grid::LAT, &grid::LON, 4, |h| {
        // cell 0 missing every hour, cell 1 missing on odd hours
        vec![
            f64::NAN,
            if h % 2 == 1 { f64::NAN } else { 20.0 + h as f64 },
            30.0,
            40.0,
        ]
    })
    .unwrap();

    let pipeline = DayPipeline::new(config(out.path()), CleanupTracker::in_memory()).unwrap();
    let saved = pipeline.process_one(&archive, Granularity::Grid, None).unwrap();
    let pm25 = floats(&read_parquet(&saved), "pm25");

    assert_eq!(pm25[0], None);
    assert_approx_eq!(pm25[1].unwrap(), 21.0, 1e-9);
    assert_approx_eq!(pm25[2].unwrap(), 30.0, 1e-9);
}

#[test]
fn test_disk_path_with_deferred_cleanup() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let archive =
        write_daily_archive(input.path(), "20130103", &grid::LAT, &grid::LON, 3, hourly_pm25).unwrap();

    let mut cfg = config(out.path());
    cfg.opener.force_disk = true;
    cfg.opener.defer_cleanup = true;
    let manifest = out.path().join("tmp_cleanup.json");
    let tracker = CleanupTracker::with_json_file(&manifest);

    let pipeline = DayPipeline::new(cfg, tracker.clone()).unwrap();
    pipeline.process_one(&archive, Granularity::Grid, None).unwrap();

    let pending = tracker.pending().unwrap();
    assert_eq!(pending.len(), 3);
    assert_eq!(extract_dirs(input.path()).len(), 3);
    assert!(manifest.exists());

    let report = tracker.drain(10).unwrap();
    assert_eq!(report.deleted.len(), 3);
    assert!(report.failed.is_empty());
    assert!(tracker.pending().unwrap().is_empty());
    assert!(extract_dirs(input.path()).is_empty());
}

#[test]
fn test_forced_disk_path_releases_immediately() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let archive =
        write_daily_archive(input.path(), "20130104", &grid::LAT, &grid::LON, 2, hourly_pm25).unwrap();

    let mut cfg = config(out.path());
    cfg.opener.force_disk = true;
    let tracker = CleanupTracker::in_memory();
    let pipeline = DayPipeline::new(cfg, tracker.clone()).unwrap();
    pipeline.process_one(&archive, Granularity::Grid, None).unwrap();

    assert!(extract_dirs(input.path()).is_empty());
    assert!(tracker.pending().unwrap().is_empty());
}

#[test]
fn test_rerun_is_byte_identical() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let archive =
        write_daily_archive(input.path(), "20130105", &grid::LAT, &grid::LON, 6, hourly_pm25).unwrap();
    let source = AdminPolygonSource::from_layer(AdminLayer::from_geojson_str(polygons::TWO_PROVINCES).unwrap());

    let pipeline = DayPipeline::new(config(out.path()), CleanupTracker::in_memory()).unwrap();
    let first_path = pipeline.process_one(&archive, Granularity::City, Some(&source)).unwrap();
    let first = std::fs::read(&first_path).unwrap();
    let second_path = pipeline.process_one(&archive, Granularity::City, Some(&source)).unwrap();
    let second = std::fs::read(&second_path).unwrap();

    assert_eq!(first_path, second_path);
    assert_eq!(first, second);
}

#[test]
fn test_city_aggregation_prefers_chinese_names() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let archive =
        write_daily_archive(input.path(), "20130106", &grid::LAT, &grid::LON, 24, hourly_pm25).unwrap();
    let source = AdminPolygonSource::from_layer(AdminLayer::from_geojson_str(polygons::TWO_PROVINCES).unwrap());

    let pipeline = DayPipeline::new(config(out.path()), CleanupTracker::in_memory()).unwrap();
    let saved = pipeline.process_one(&archive, Granularity::City, Some(&source)).unwrap();
    assert_eq!(saved, out.path().join("city/2013/01/06/20130106.parquet"));

    let batch = read_parquet(&saved);
    assert_eq!(batch.num_rows(), 2);
    // sorted by (province, city): "Guangxi" sorts before "广东"
    assert_eq!(
        strings(&batch, "province"),
        vec![Some("Guangxi".to_string()), Some("广东".to_string())]
    );
    assert_eq!(
        strings(&batch, "admin_name"),
        vec![Some("Nanning".to_string()), Some("广州".to_string())]
    );
    assert_eq!(
        strings(&batch, "admin_level"),
        vec![Some("city".to_string()), Some("city".to_string())]
    );

    let cells = batch.column_by_name("cells").unwrap();
    let cells = cells.as_any().downcast_ref::<UInt64Array>().unwrap();
    assert_eq!(cells.values().to_vec(), vec![2, 2]);

    // Guangxi holds cells 1 and 3 (lon 111), Guangdong cells 0 and 2 (lon 110)
    let pm25 = floats(&batch, "pm25");
    assert_approx_eq!(pm25[0].unwrap(), 30.0 + 11.5, 1e-9);
    assert_approx_eq!(pm25[1].unwrap(), 20.0 + 11.5, 1e-9);
}

#[test]
fn test_boundary_cells_resolved_by_intersects() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    // lon 110.5 lies exactly on the shared province edge
    let archive = write_daily_archive(input.path(), "20130107", &grid::LAT, &[110.5, 111.0], 2, hourly_pm25).unwrap();
    let source = AdminPolygonSource::from_layer(AdminLayer::from_geojson_str(polygons::TWO_PROVINCES).unwrap());

    let pipeline = DayPipeline::new(config(out.path()), CleanupTracker::in_memory()).unwrap();
    let saved = pipeline
        .process_one(&archive, Granularity::Province, Some(&source))
        .unwrap();

    let batch = read_parquet(&saved);
    let cells = batch.column_by_name("cells").unwrap();
    let cells = cells.as_any().downcast_ref::<UInt64Array>().unwrap();
    assert_eq!(cells.values().iter().sum::<u64>(), 4);
    assert!(batch.column_by_name("city").is_none());
}

#[test]
fn test_mapping_failure_falls_back_to_grid() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let archive =
        write_daily_archive(input.path(), "20130108", &grid::LAT, &grid::LON, 2, hourly_pm25).unwrap();
    let source =
        AdminPolygonSource::from_layer(AdminLayer::from_geojson_str(polygons::NO_ADMIN_COLUMNS).unwrap());

    let pipeline = DayPipeline::new(config(out.path()), CleanupTracker::in_memory()).unwrap();
    let saved = pipeline.process_one(&archive, Granularity::City, Some(&source)).unwrap();

    assert_eq!(saved, out.path().join("grid/2013/01/08/20130108.parquet"));
    assert_eq!(read_parquet(&saved).num_rows(), 4);
}

#[test]
fn test_missing_polygon_file_falls_back_to_grid() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let archive =
        write_daily_archive(input.path(), "20130109", &grid::LAT, &grid::LON, 2, hourly_pm25).unwrap();
    let source = AdminPolygonSource::from_path(input.path().join("missing.geojson"));

    let pipeline = DayPipeline::new(config(out.path()), CleanupTracker::in_memory()).unwrap();
    let saved = pipeline
        .process_one(&archive, Granularity::Province, Some(&source))
        .unwrap();
    assert!(saved.starts_with(out.path().join("grid")));
}

#[test]
fn test_archive_without_snapshots_fails() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let archive = input.path().join("CN-Reanalysis20130110.zip");
    write_zip(&archive, &[("readme.txt".to_string(), b"no grids".to_vec())]).unwrap();

    let pipeline = DayPipeline::new(config(out.path()), CleanupTracker::in_memory()).unwrap();
    let err = pipeline.process_one(&archive, Granularity::Grid, None).unwrap_err();
    assert!(matches!(err, IngestionError::NoUsableSnapshot(_)));
}

#[test]
fn test_undecodable_snapshots_are_skipped() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let archive = input.path().join("CN-Reanalysis20130111.zip");
    let good = SnapshotCdl::new("CN-Reanalysis2013011101", grid::LAT.to_vec(), grid::LON.to_vec())
        .variable("pm25", vec![1.0, 2.0, 3.0, 4.0])
        .render();
    write_zip(
        &archive,
        &[
            ("CN-Reanalysis2013011100.nc".to_string(), b"\x89HDF garbage".to_vec()),
            ("CN-Reanalysis2013011101.nc".to_string(), good.into_bytes()),
        ],
    )
    .unwrap();

    let pipeline = DayPipeline::new(config(out.path()), CleanupTracker::in_memory()).unwrap();
    let saved = pipeline.process_one(&archive, Granularity::Grid, None).unwrap();
    let pm25 = floats(&read_parquet(&saved), "pm25");
    assert_eq!(pm25, vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
    assert!(extract_dirs(input.path()).is_empty());
}

#[test]
fn test_global_percentile_never_widens_range() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let lat: Vec<f64> = (0..10).map(|i| 30.0 + i as f64 * 0.1).collect();
    let lon: Vec<f64> = (0..10).map(|i| 110.0 + i as f64 * 0.1).collect();
    let archive = write_daily_archive(input.path(), "20130112", &lat, &lon, 1, |_| {
        let mut values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        values[99] = 1400.0;
        values
    })
    .unwrap();

    let mut cfg = config(out.path());
    cfg.outliers = OutlierPolicy::global_percentile();
    let pipeline = DayPipeline::new(cfg, CleanupTracker::in_memory()).unwrap();
    let saved = pipeline.process_one(&archive, Granularity::Grid, None).unwrap();

    let pm25: Vec<f64> = floats(&read_parquet(&saved), "pm25").into_iter().flatten().collect();
    let max = pm25.iter().cloned().fold(f64::MIN, f64::max);
    let min = pm25.iter().cloned().fold(f64::MAX, f64::min);
    assert!(max < 1400.0);
    assert!(min >= 0.0);
}

#[test]
fn test_snapshot_directory_mode() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dir = input.path().join("CN-Reanalysis20130113");
    std::fs::create_dir(&dir).unwrap();
    for h in 0..3 {
        let name = format!("CN-Reanalysis20130113{:02}", h);
        let text = SnapshotCdl::new(&name, grid::LAT.to_vec(), grid::LON.to_vec())
            .variable("pm25", hourly_pm25(h))
            .render();
        std::fs::write(dir.join(format!("{}.nc", name)), text).unwrap();
    }

    let pipeline = DayPipeline::new(config(out.path()), CleanupTracker::in_memory()).unwrap();
    let saved = pipeline.process_snapshot_dir(&dir, Granularity::Grid, None).unwrap();
    assert_eq!(saved, out.path().join("grid/2013/01/13/20130113.parquet"));
    let pm25 = floats(&read_parquet(&saved), "pm25");
    assert_approx_eq!(pm25[0].unwrap(), 11.0, 1e-9);
}

#[test]
fn test_curvilinear_archive_with_scalars_and_fill_values() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let lat = vec![30.0, 31.0];
    let lon = vec![110.0, 111.0, 112.0];
    // cell (1, 2) is missing every hour
    let base = create_grid_with_nans(3, 2, &[(1, 2)]);
    let cycle = hourly_cycle(0.0, 5.0);

    let entries: Vec<(String, Vec<u8>)> = (0..24)
        .map(|h| {
            let name = format!("CN-Reanalysis20130114{:02}", h);
            let pm25: Vec<f64> = base.iter().map(|v| 20.0 + v + cycle[h]).collect();
            let text = SnapshotCdl::new(&name, lat.clone(), lon.clone())
                .layout(CoordinateLayout::Curvilinear)
                .variable("pm25", pm25)
                .variable("no2", create_constant_grid(3, 2, FILL_VALUE))
                .scalar("so2", 5.0 + h as f64)
                .render();
            (format!("{}.nc", name), text.into_bytes())
        })
        .collect();
    let archive = input.path().join("CN-Reanalysis20130114.zip");
    write_zip(&archive, &entries).unwrap();

    let pipeline = DayPipeline::new(config(out.path()), CleanupTracker::in_memory()).unwrap();
    let saved = pipeline.process_one(&archive, Granularity::Grid, None).unwrap();
    let batch = read_parquet(&saved);
    assert_eq!(batch.num_rows(), 6);

    // per-cell lat2d/lon2d are used as-is, row-major over (y, x)
    assert_eq!(
        floats(&batch, "lat"),
        vec![Some(30.0), Some(30.0), Some(30.0), Some(31.0), Some(31.0), Some(31.0)]
    );
    assert_eq!(
        floats(&batch, "lon"),
        vec![Some(110.0), Some(111.0), Some(112.0), Some(110.0), Some(111.0), Some(112.0)]
    );

    // the daily cycle averages out, leaving 20 + row * 10 + col
    let pm25 = floats(&batch, "pm25");
    for (i, expected) in [20.0, 21.0, 22.0, 30.0, 31.0].iter().enumerate() {
        assert_approx_eq!(pm25[i].unwrap(), *expected, 1e-9);
    }
    assert_eq!(pm25[5], None);

    // values equal to _FillValue decode as missing
    assert_eq!(floats(&batch, "no2"), vec![None; 6]);

    // scalars broadcast to every cell before averaging
    for value in floats(&batch, "so2") {
        assert_approx_eq!(value.unwrap(), 5.0 + 11.5, 1e-9);
    }
}
