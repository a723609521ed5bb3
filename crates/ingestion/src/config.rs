//! Configuration for daily archive ingestion.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IngestionError, Result};

/// Variables extracted from each snapshot by default.
pub const DEFAULT_VARIABLES: &[&str] = &[
    "pm25", "pm10", "so2", "no2", "co", "o3", "temp", "rh", "psfc", "u", "v",
];

/// Most decimal places a rounded-coordinate key may keep. Longitudes scaled
/// by `10^9` stay well inside `i64`.
pub const MAX_KEY_DECIMALS: u32 = 9;

/// Top-level ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Root of the persisted daily tables.
    pub output_dir: PathBuf,

    /// File name prefix of the daily archives (`<prefix>YYYYMMDD.zip`).
    pub archive_prefix: String,

    /// Extension of embedded snapshot entries, compared case-insensitively.
    pub snapshot_extension: String,

    /// Variables extracted from each snapshot.
    pub variables: Vec<String>,

    /// Reduce snapshots to a per-cell daily mean. When false the long
    /// diagnostic layout (every cell for every snapshot) is produced instead.
    pub aggregate_mean: bool,

    pub opener: OpenerConfig,

    /// Physical bounds per variable; values outside become missing.
    pub bounds: BTreeMap<String, Bounds>,

    pub outliers: OutlierPolicy,

    pub mapping: MappingConfig,

    pub batch: BatchConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data/processed"),
            archive_prefix: "CN-Reanalysis".to_string(),
            snapshot_extension: ".nc".to_string(),
            variables: DEFAULT_VARIABLES.iter().map(|v| v.to_string()).collect(),
            aggregate_mean: true,
            opener: OpenerConfig::default(),
            bounds: default_bounds(),
            outliers: OutlierPolicy::default(),
            mapping: MappingConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from a YAML file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            IngestionError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        config.validate().map_err(IngestionError::InvalidConfig)?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.archive_prefix.is_empty() {
            return Err("archive_prefix must not be empty".to_string());
        }

        if self.snapshot_extension.is_empty() {
            return Err("snapshot_extension must not be empty".to_string());
        }

        for (name, bounds) in &self.bounds {
            if bounds.min > bounds.max {
                return Err(format!(
                    "bounds for {} are inverted ({} > {})",
                    name, bounds.min, bounds.max
                ));
            }
        }

        self.outliers.validate()?;
        self.batch.validate()?;

        if self.mapping.coordinate_decimals > MAX_KEY_DECIMALS {
            return Err(format!(
                "mapping.coordinate_decimals must be <= {}",
                MAX_KEY_DECIMALS
            ));
        }

        if self.mapping.script.start > self.mapping.script.end {
            return Err("mapping.script range is inverted".to_string());
        }

        Ok(())
    }

    /// Whether `name` is a snapshot entry for this configuration.
    pub fn is_snapshot_name(&self, name: &str) -> bool {
        name.to_lowercase()
            .ends_with(&self.snapshot_extension.to_lowercase())
    }
}

// ============================================================================
// Opener
// ============================================================================

/// Controls how snapshots are pulled out of archives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenerConfig {
    /// Largest entry read straight into memory, and largest extracted file
    /// eagerly loaded. `None` means no ceiling.
    pub max_in_memory_bytes: Option<u64>,

    /// Always extract to disk, even when an in-memory decode is possible.
    pub force_disk: bool,

    /// Record temporary directories in the cleanup manifest instead of
    /// deleting them as soon as they are released.
    pub defer_cleanup: bool,

    /// JSON manifest of temporary directories pending deletion.
    pub cleanup_manifest: PathBuf,
}

impl Default for OpenerConfig {
    fn default() -> Self {
        Self {
            max_in_memory_bytes: Some(512 * 1024 * 1024),
            force_disk: false,
            defer_cleanup: false,
            cleanup_manifest: PathBuf::from("data/tmp_cleanup.json"),
        }
    }
}

impl OpenerConfig {
    /// Whether a payload of `size` bytes fits under the in-memory ceiling.
    pub fn within_ceiling(&self, size: u64) -> bool {
        self.max_in_memory_bytes.map_or(true, |max| size <= max)
    }
}

// ============================================================================
// Outlier policy
// ============================================================================

/// Inclusive physical range for one variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Physical bounds for the standard reanalysis variables.
///
/// Particulates and gases in µg/m³ (CO in mg/m³), temperature in K,
/// humidity in %, surface pressure in Pa, wind in m/s.
pub fn default_bounds() -> BTreeMap<String, Bounds> {
    [
        ("pm25", Bounds::new(0.0, 1500.0)),
        ("pm10", Bounds::new(0.0, 3000.0)),
        ("so2", Bounds::new(0.0, 2000.0)),
        ("no2", Bounds::new(0.0, 1000.0)),
        ("co", Bounds::new(0.0, 50.0)),
        ("o3", Bounds::new(0.0, 1000.0)),
        ("temp", Bounds::new(180.0, 340.0)),
        ("rh", Bounds::new(0.0, 100.0)),
        ("psfc", Bounds::new(30_000.0, 110_000.0)),
        ("u", Bounds::new(-100.0, 100.0)),
        ("v", Bounds::new(-100.0, 100.0)),
    ]
    .into_iter()
    .map(|(name, b)| (name.to_string(), b))
    .collect()
}

/// Statistical outlier pass applied after the physical bounds pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum OutlierPolicy {
    /// Clip every column to its own `[lower, upper]` quantile range.
    GlobalPercentile { lower: f64, upper: f64 },

    /// Clip to `[Q1 - k·IQR, Q3 + k·IQR]` computed per group.
    GroupedIqr {
        k: f64,
        #[serde(default)]
        group_by: GroupKey,
    },

    None,
}

impl Default for OutlierPolicy {
    fn default() -> Self {
        Self::GroupedIqr {
            k: 1.5,
            group_by: GroupKey::Coordinate,
        }
    }
}

impl OutlierPolicy {
    /// The faster, coarser alternative: clip to the 0.5th/99.5th percentiles.
    pub fn global_percentile() -> Self {
        Self::GlobalPercentile {
            lower: 0.005,
            upper: 0.995,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::GlobalPercentile { lower, upper } => {
                if !(0.0..=1.0).contains(lower) || !(0.0..=1.0).contains(upper) {
                    return Err("percentile bounds must be within [0, 1]".to_string());
                }
                if lower > upper {
                    return Err("lower percentile must not exceed upper".to_string());
                }
            }
            Self::GroupedIqr { k, group_by } => {
                if !(*k > 0.0) {
                    return Err("IQR k must be > 0".to_string());
                }
                if let GroupKey::RoundedCoordinate { decimals } = group_by {
                    if *decimals > MAX_KEY_DECIMALS {
                        return Err(format!("group_by decimals must be <= {}", MAX_KEY_DECIMALS));
                    }
                }
            }
            Self::None => {}
        }
        Ok(())
    }
}

/// Rows sharing a key form one IQR group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupKey {
    /// Exact (lat, lon).
    #[default]
    Coordinate,
    /// (lat, lon) rounded to `decimals` places.
    RoundedCoordinate { decimals: u32 },
}

// ============================================================================
// Admin mapping
// ============================================================================

/// What happens to rows outside every admin polygon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedPolicy {
    /// Leave them out of admin-level output.
    #[default]
    Drop,
    /// Keep them with missing names.
    RetainUnknown,
}

/// Inclusive range of code points that count as the preferred script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRange {
    pub start: u32,
    pub end: u32,
}

impl Default for ScriptRange {
    /// CJK Unified Ideographs.
    fn default() -> Self {
        Self {
            start: 0x4E00,
            end: 0x9FFF,
        }
    }
}

impl ScriptRange {
    pub fn matches(&self, text: &str) -> bool {
        text.chars()
            .any(|c| (self.start..=self.end).contains(&(c as u32)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Precision of the rounded-coordinate join key.
    pub coordinate_decimals: u32,

    /// Use a non-script name when no preferred-script name exists.
    pub fill_english_if_missing: bool,

    /// Cap on the fallback samples kept for reporting.
    pub sample_limit: usize,

    pub unresolved: UnresolvedPolicy,

    pub script: ScriptRange,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            coordinate_decimals: 4,
            fill_english_if_missing: true,
            sample_limit: 50,
            unresolved: UnresolvedPolicy::Drop,
            script: ScriptRange::default(),
        }
    }
}

// ============================================================================
// Batch
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Archives processed concurrently.
    pub workers: usize,

    /// Run the heartbeat thread.
    pub verbose: bool,

    pub heartbeat_secs: u64,

    /// Log a progress line every this many completions.
    pub progress_every: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            verbose: false,
            heartbeat_secs: 5,
            progress_every: 10,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be > 0".to_string());
        }
        if self.heartbeat_secs == 0 {
            return Err("heartbeat_secs must be > 0".to_string());
        }
        if self.progress_every == 0 {
            return Err("progress_every must be > 0".to_string());
        }
        Ok(())
    }
}
