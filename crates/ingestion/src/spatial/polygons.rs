//! Administrative polygon layers loaded from GeoJSON.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use geo::{BoundingRect, Contains, Intersects, LineString, MultiPolygon, Point, Polygon, Rect};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::columns::{resolve_columns, ColumnResolution};
use crate::error::{IngestionError, Result};

/// Point-in-polygon test used by a join pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// Point strictly inside the polygon; boundary points do not match.
    Within,
    /// Point inside or on the boundary.
    Intersects,
}

// ============================================================================
// GeoJSON input
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawCollection {
    features: Vec<RawFeature>,
}

#[derive(Debug, Deserialize)]
struct RawFeature {
    #[serde(default)]
    properties: Option<serde_json::Map<String, Value>>,
    geometry: Option<RawGeometry>,
}

/// Positions are kept as `Vec<f64>` so 3-D coordinates still parse.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RawGeometry {
    Polygon { coordinates: Vec<Vec<Vec<f64>>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Vec<f64>>>> },
    #[serde(other)]
    Unsupported,
}

fn ring(positions: &[Vec<f64>]) -> LineString<f64> {
    positions
        .iter()
        .filter(|p| p.len() >= 2)
        .map(|p| (p[0], p[1]))
        .collect::<Vec<_>>()
        .into()
}

fn polygon(rings: &[Vec<Vec<f64>>]) -> Option<Polygon<f64>> {
    let (exterior, holes) = rings.split_first()?;
    Some(Polygon::new(ring(exterior), holes.iter().map(|h| ring(h)).collect()))
}

impl RawGeometry {
    fn into_multi_polygon(self) -> Option<MultiPolygon<f64>> {
        match self {
            Self::Polygon { coordinates } => polygon(&coordinates).map(|p| MultiPolygon::new(vec![p])),
            Self::MultiPolygon { coordinates } => {
                let polys: Vec<_> = coordinates.iter().filter_map(|p| polygon(p)).collect();
                (!polys.is_empty()).then(|| MultiPolygon::new(polys))
            }
            Self::Unsupported => None,
        }
    }
}

fn attribute_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

// ============================================================================
// Layer
// ============================================================================

/// One administrative unit.
#[derive(Debug, Clone)]
pub struct AdminFeature {
    /// Attribute values aligned with [`AdminLayer::columns`].
    pub attributes: Vec<Option<String>>,
    pub geometry: MultiPolygon<f64>,
    bbox: Rect<f64>,
}

impl AdminFeature {
    fn matches(&self, point: &Point<f64>, predicate: Predicate) -> bool {
        let (min, max) = (self.bbox.min(), self.bbox.max());
        if point.x() < min.x || point.x() > max.x || point.y() < min.y || point.y() > max.y {
            return false;
        }
        match predicate {
            Predicate::Within => self.geometry.contains(point),
            Predicate::Intersects => self.geometry.intersects(point),
        }
    }
}

/// Polygons plus their attribute table.
#[derive(Debug, Clone)]
pub struct AdminLayer {
    /// Attribute column names in first-seen order.
    pub columns: Vec<String>,
    pub features: Vec<AdminFeature>,
    /// Canonical field resolution, computed once per load.
    pub resolution: ColumnResolution,
}

impl AdminLayer {
    /// Build a layer from features given as (attributes, geometry).
    pub fn new(columns: Vec<String>, features: Vec<(Vec<Option<String>>, MultiPolygon<f64>)>) -> Self {
        let features = features
            .into_iter()
            .filter_map(|(attributes, geometry)| {
                let bbox = geometry.bounding_rect()?;
                Some(AdminFeature {
                    attributes,
                    geometry,
                    bbox,
                })
            })
            .collect();
        let resolution = resolve_columns(&joined_column_names(&columns));
        Self {
            columns,
            features,
            resolution,
        }
    }

    /// Parse a GeoJSON FeatureCollection. Features without polygonal
    /// geometry are skipped.
    pub fn from_geojson_str(text: &str) -> Result<Self> {
        let raw: RawCollection = serde_json::from_str(text)
            .map_err(|e| IngestionError::Mapping(format!("invalid GeoJSON: {}", e)))?;

        let mut columns: Vec<String> = Vec::new();
        for feature in &raw.features {
            if let Some(props) = &feature.properties {
                for key in props.keys() {
                    if !columns.contains(key) {
                        columns.push(key.clone());
                    }
                }
            }
        }

        let features = raw
            .features
            .into_iter()
            .filter_map(|feature| {
                let geometry = feature.geometry?.into_multi_polygon()?;
                let attributes = columns
                    .iter()
                    .map(|c| {
                        feature
                            .properties
                            .as_ref()
                            .and_then(|p| p.get(c))
                            .and_then(attribute_text)
                    })
                    .collect();
                Some((attributes, geometry))
            })
            .collect();

        let layer = Self::new(columns, features);
        if layer.features.is_empty() {
            return Err(IngestionError::Mapping(
                "polygon source has no polygonal features".to_string(),
            ));
        }
        Ok(layer)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            IngestionError::Mapping(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_geojson_str(&text)
    }

    /// Index of the first feature matching (lon, lat) under `predicate`.
    pub fn locate(&self, lon: f64, lat: f64, predicate: Predicate) -> Option<usize> {
        if lon.is_nan() || lat.is_nan() {
            return None;
        }
        let point = Point::new(lon, lat);
        self.features.iter().position(|f| f.matches(&point, predicate))
    }
}

/// Column names as they appear after joining onto a lat/lon table.
///
/// Attribute columns that collide with the point table's own columns get a
/// `_right` suffix.
pub fn joined_column_names(columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .map(|c| {
            if c == "lat" || c == "lon" {
                format!("{}_right", c)
            } else {
                c.clone()
            }
        })
        .collect()
}

/// A polygon file loaded on first use and shared afterwards.
#[derive(Debug)]
pub struct AdminPolygonSource {
    path: Option<PathBuf>,
    layer: OnceLock<std::result::Result<Arc<AdminLayer>, String>>,
}

impl AdminPolygonSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            layer: OnceLock::new(),
        }
    }

    pub fn from_layer(layer: AdminLayer) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Ok(Arc::new(layer)));
        Self { path: None, layer: cell }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The loaded layer. A failed load is remembered and reported again.
    pub fn layer(&self) -> Result<Arc<AdminLayer>> {
        self.layer
            .get_or_init(|| {
                let path = self
                    .path
                    .as_deref()
                    .ok_or_else(|| "polygon source has no path".to_string())?;
                let layer = AdminLayer::from_file(path).map_err(|e| e.to_string())?;
                info!(
                    path = %path.display(),
                    features = layer.features.len(),
                    columns = layer.columns.len(),
                    "Loaded admin polygons"
                );
                Ok(Arc::new(layer))
            })
            .clone()
            .map_err(IngestionError::Mapping)
    }
}
