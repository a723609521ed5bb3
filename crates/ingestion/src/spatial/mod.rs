//! Resolving grid cells to administrative units.
//!
//! Coordinates are rounded and deduplicated before any polygon test, so the
//! join runs once per distinct location. A strict "within" pass runs first;
//! points it leaves unresolved (typically on a shared border) get a second
//! "intersects" pass. Results are merged back onto every row by rounded key.

pub mod columns;
pub mod names;
pub mod polygons;

use std::collections::HashMap;

use tracing::{debug, info};

use crate::config::{MappingConfig, UnresolvedPolicy};
use crate::error::{IngestionError, Result};
use crate::temporal::DailyTable;

pub use columns::{resolve_columns, CanonicalField, ColumnResolution, FieldRule};
pub use names::{normalize_name, AdminNames, FallbackStats, NameResolver};
pub use polygons::{AdminLayer, AdminPolygonSource, Predicate};

/// `value` scaled by `10^decimals` and rounded, as an exact join key.
pub fn round_key(value: f64, decimals: u32) -> i64 {
    (value * 10f64.powi(decimals as i32)).round() as i64
}

/// Resolved names for one rounded coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminMappingRecord {
    pub key: (i64, i64),
    pub names: AdminNames,
    /// Province or city came from a non-script fallback value.
    pub used_fallback: bool,
    /// Granularity the mapping was produced for (`city` or `province`).
    pub admin_level: String,
}

/// Counters from one mapping run.
#[derive(Debug, Clone, Default)]
pub struct MappingStats {
    pub unique_points: usize,
    pub within_hits: usize,
    pub intersects_hits: usize,
    pub unresolved_points: usize,
    pub dropped_rows: usize,
    pub fallback: FallbackStats,
}

/// A daily table with admin names attached to every row.
#[derive(Debug, Clone)]
pub struct MappedTable {
    pub table: DailyTable,
    pub province: Vec<Option<String>>,
    pub city: Vec<Option<String>>,
    pub admin_name: Vec<Option<String>>,
    pub admin_level: String,
    pub stats: MappingStats,
}

/// Joins table rows against an admin layer.
#[derive(Debug, Clone)]
pub struct SpatialMapper<'a> {
    layer: &'a AdminLayer,
    config: &'a MappingConfig,
    resolver: NameResolver,
}

impl<'a> SpatialMapper<'a> {
    pub fn new(layer: &'a AdminLayer, config: &'a MappingConfig) -> Self {
        Self {
            layer,
            config,
            resolver: NameResolver::new(config.script, config.fill_english_if_missing),
        }
    }

    /// Resolve each distinct rounded coordinate.
    pub fn map_unique(&self, keys: &[(i64, i64)], admin_level: &str, stats: &mut MappingStats) -> Result<Vec<AdminMappingRecord>> {
        let resolution = &self.layer.resolution;
        if resolution.is_empty() {
            return Err(IngestionError::Mapping(format!(
                "no province/city columns among {:?}",
                self.layer.columns
            )));
        }

        let scale = 10f64.powi(self.config.coordinate_decimals as i32);
        let mut hits: Vec<Option<usize>> = keys
            .iter()
            .map(|(lat, lon)| {
                self.layer
                    .locate(*lon as f64 / scale, *lat as f64 / scale, Predicate::Within)
            })
            .collect();
        stats.within_hits = hits.iter().filter(|h| h.is_some()).count();

        for (hit, (lat, lon)) in hits.iter_mut().zip(keys) {
            if hit.is_none() {
                *hit = self
                    .layer
                    .locate(*lon as f64 / scale, *lat as f64 / scale, Predicate::Intersects);
                if hit.is_some() {
                    stats.intersects_hits += 1;
                }
            }
        }

        let records = keys
            .iter()
            .zip(hits)
            .map(|(key, hit)| {
                let (names, used_fallback) = match hit {
                    Some(index) => {
                        let attrs = &self.layer.features[index].attributes;
                        let value = |i: &usize| attrs.get(*i).and_then(|v| v.as_deref());
                        self.resolver.resolve(
                            resolution.province.iter().map(value),
                            resolution.city.iter().map(value),
                            resolution.admin_label.as_ref().and_then(value),
                        )
                    }
                    None => (AdminNames::default(), false),
                };
                AdminMappingRecord {
                    key: *key,
                    names,
                    used_fallback,
                    admin_level: admin_level.to_string(),
                }
            })
            .collect::<Vec<_>>();

        stats.unresolved_points = records.iter().filter(|r| !r.names.is_resolved()).count();
        Ok(records)
    }

    /// Attach admin names to every row of `table`.
    pub fn map_table(&self, table: DailyTable, admin_level: &str) -> Result<MappedTable> {
        let d = self.config.coordinate_decimals;
        let row_keys: Vec<Option<(i64, i64)>> = table
            .lat
            .iter()
            .zip(&table.lon)
            .map(|(lat, lon)| {
                (!lat.is_nan() && !lon.is_nan()).then(|| (round_key(*lat, d), round_key(*lon, d)))
            })
            .collect();

        let mut rows_per_key: HashMap<(i64, i64), usize> = HashMap::new();
        let mut unique = Vec::new();
        for key in row_keys.iter().flatten() {
            let rows = rows_per_key.entry(*key).or_insert(0);
            if *rows == 0 {
                unique.push(*key);
            }
            *rows += 1;
        }

        let mut stats = MappingStats {
            unique_points: unique.len(),
            fallback: FallbackStats::new(self.config.sample_limit),
            ..MappingStats::default()
        };
        let records = self.map_unique(&unique, admin_level, &mut stats)?;
        for record in records.iter().filter(|r| r.used_fallback) {
            let rows = rows_per_key.get(&record.key).copied().unwrap_or(0);
            stats.fallback.note(&record.names, rows);
        }
        let by_key: HashMap<(i64, i64), AdminNames> =
            records.into_iter().map(|r| (r.key, r.names)).collect();

        let mut province = Vec::with_capacity(row_keys.len());
        let mut city = Vec::with_capacity(row_keys.len());
        let mut admin_name = Vec::with_capacity(row_keys.len());
        let mut keep = Vec::with_capacity(row_keys.len());

        for key in &row_keys {
            let names = key.and_then(|k| by_key.get(&k)).cloned().unwrap_or_default();
            let resolved = names.is_resolved();
            if !resolved && self.config.unresolved == UnresolvedPolicy::Drop {
                keep.push(false);
                continue;
            }
            keep.push(true);
            province.push(names.province);
            city.push(names.city);
            admin_name.push(names.admin_name);
        }

        let mut table = table;
        stats.dropped_rows = keep.iter().filter(|k| !**k).count();
        if stats.dropped_rows > 0 {
            table.retain_rows(&keep);
        }

        info!(
            unique_points = stats.unique_points,
            within = stats.within_hits,
            intersects = stats.intersects_hits,
            unresolved = stats.unresolved_points,
            dropped_rows = stats.dropped_rows,
            fallback_rows = stats.fallback.fallback_rows,
            "Mapped grid cells to admin units"
        );
        if !stats.fallback.samples.is_empty() {
            debug!(samples = ?stats.fallback.samples, "Fallback name samples");
        }

        Ok(MappedTable {
            table,
            province,
            city,
            admin_name,
            admin_level: admin_level.to_string(),
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const LAYER: &str = r#"{
      "type": "FeatureCollection",
      "features": [
        {"type": "Feature",
         "properties": {"NAME_1": "Guangdong", "NL_NAME_1": "广东", "NAME_2": "Guangzhou", "NL_NAME_2": "广州"},
         "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}},
        {"type": "Feature",
         "properties": {"NAME_1": "Guangxi", "NL_NAME_1": "NA", "NAME_2": "Nanning", "NL_NAME_2": null},
         "geometry": {"type": "Polygon", "coordinates": [[[1,0],[2,0],[2,1],[1,1],[1,0]]]}}
      ]
    }"#;

    fn table(points: &[(f64, f64)]) -> DailyTable {
        DailyTable {
            lat: points.iter().map(|p| p.0).collect(),
            lon: points.iter().map(|p| p.1).collect(),
            time: None,
            columns: BTreeMap::from([(
                "pm25".to_string(),
                (0..points.len()).map(|i| i as f64).collect(),
            )]),
        }
    }

    #[test]
    fn test_round_key() {
        assert_eq!(round_key(30.12345, 4), 301235);
        assert_eq!(round_key(-0.00004, 4), 0);
    }

    #[test]
    fn test_map_table_within_and_boundary() {
        let layer = AdminLayer::from_geojson_str(LAYER).unwrap();
        let config = MappingConfig::default();
        let mapper = SpatialMapper::new(&layer, &config);

        // (lat, lon): inside first, inside second, on shared edge, outside
        let t = table(&[(0.5, 0.5), (0.5, 1.5), (0.5, 1.0), (5.0, 5.0), (0.50001, 0.50001)]);
        let mapped = mapper.map_table(t, "city").unwrap();

        assert_eq!(mapped.stats.unique_points, 4);
        assert_eq!(mapped.stats.within_hits, 2);
        assert_eq!(mapped.stats.intersects_hits, 1);
        assert_eq!(mapped.stats.dropped_rows, 1);
        assert_eq!(mapped.table.row_count(), 4);

        assert_eq!(mapped.province[0].as_deref(), Some("广东"));
        assert_eq!(mapped.city[0].as_deref(), Some("广州"));
        assert_eq!(mapped.province[1].as_deref(), Some("Guangxi"));
        assert_eq!(mapped.city[1].as_deref(), Some("Nanning"));
        assert!(mapped.city[2].is_some());
        assert_eq!(mapped.city[3].as_deref(), Some("广州"));
        assert_eq!(mapped.table.column("pm25").unwrap(), &[0.0, 1.0, 2.0, 4.0]);
        assert_eq!(mapped.stats.fallback.fallback_rows, 1);
    }

    #[test]
    fn test_fallback_counts_every_row() {
        let layer = AdminLayer::from_geojson_str(LAYER).unwrap();
        let config = MappingConfig::default();
        let mapper = SpatialMapper::new(&layer, &config);

        // three rows share one location in the English-only polygon
        let t = table(&[(0.5, 1.5), (0.5, 1.5), (0.50001, 1.50001), (0.5, 0.5)]);
        let mapped = mapper.map_table(t, "city").unwrap();

        assert_eq!(mapped.stats.unique_points, 2);
        assert_eq!(mapped.stats.fallback.fallback_rows, 3);
        assert_eq!(
            mapped.stats.fallback.samples,
            vec![(Some("Guangxi".to_string()), Some("Nanning".to_string()))]
        );
    }

    #[test]
    fn test_retain_unknown_policy() {
        let layer = AdminLayer::from_geojson_str(LAYER).unwrap();
        let config = MappingConfig {
            unresolved: UnresolvedPolicy::RetainUnknown,
            ..MappingConfig::default()
        };
        let mapper = SpatialMapper::new(&layer, &config);
        let mapped = mapper.map_table(table(&[(5.0, 5.0), (0.5, 0.5)]), "province").unwrap();
        assert_eq!(mapped.table.row_count(), 2);
        assert_eq!(mapped.province[0], None);
        assert_eq!(mapped.admin_name[0], None);
        assert_eq!(mapped.admin_level, "province");
    }

    #[test]
    fn test_layer_without_admin_columns_fails() {
        let layer = AdminLayer::from_geojson_str(
            r#"{"type":"FeatureCollection","features":[{"type":"Feature","properties":{"id":1},
            "geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]}}]}"#,
        )
        .unwrap();
        let config = MappingConfig::default();
        let err = SpatialMapper::new(&layer, &config).map_table(table(&[(0.1, 0.5)]), "city");
        assert!(matches!(err, Err(IngestionError::Mapping(_))));
    }
}
