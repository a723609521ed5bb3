//! Physical-bounds and statistical outlier removal.
//!
//! The bounds pass turns out-of-range values into missing values. The
//! statistical pass then clips (never removes) what is left.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::config::{Bounds, GroupKey, OutlierPolicy};
use crate::temporal::DailyTable;

/// Smallest group that has meaningful quartiles.
const MIN_GROUP_SIZE: usize = 4;

/// Counts of values touched by each pass, per variable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutlierReport {
    pub non_finite: BTreeMap<String, usize>,
    pub out_of_bounds: BTreeMap<String, usize>,
    pub clipped: BTreeMap<String, usize>,
    /// IQR groups left alone for having fewer than four present values.
    pub small_groups: usize,
}

/// Run the bounds pass, then the configured statistical pass.
pub fn filter_outliers(
    table: &mut DailyTable,
    bounds: &BTreeMap<String, Bounds>,
    policy: &OutlierPolicy,
) -> OutlierReport {
    let mut report = OutlierReport::default();

    for (name, values) in table.columns.iter_mut() {
        let n = coerce_non_finite(values);
        if n > 0 {
            report.non_finite.insert(name.clone(), n);
        }
    }

    report.out_of_bounds = apply_bounds(table, bounds);

    match policy {
        OutlierPolicy::GlobalPercentile { lower, upper } => {
            report.clipped = clip_global_percentile(table, *lower, *upper);
        }
        OutlierPolicy::GroupedIqr { k, group_by } => {
            let (clipped, small) = clip_grouped_iqr(table, *k, *group_by);
            report.clipped = clipped;
            report.small_groups = small;
        }
        OutlierPolicy::None => {}
    }

    debug!(
        out_of_bounds = report.out_of_bounds.values().sum::<usize>(),
        clipped = report.clipped.values().sum::<usize>(),
        small_groups = report.small_groups,
        "Outlier filter applied"
    );
    report
}

fn coerce_non_finite(values: &mut [f64]) -> usize {
    let mut n = 0;
    for v in values.iter_mut() {
        if v.is_infinite() {
            *v = f64::NAN;
            n += 1;
        }
    }
    n
}

/// Replace values outside each variable's physical range with NaN.
pub fn apply_bounds(table: &mut DailyTable, bounds: &BTreeMap<String, Bounds>) -> BTreeMap<String, usize> {
    let mut removed = BTreeMap::new();
    for (name, range) in bounds {
        let Some(values) = table.columns.get_mut(name) else {
            continue;
        };
        let mut n = 0;
        for v in values.iter_mut() {
            if !v.is_nan() && !range.contains(*v) {
                *v = f64::NAN;
                n += 1;
            }
        }
        if n > 0 {
            removed.insert(name.clone(), n);
        }
    }
    removed
}

/// Quantile of sorted data with linear interpolation between ranks.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

fn sorted_present(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut present: Vec<f64> = values.filter(|v| !v.is_nan()).collect();
    present.sort_by(f64::total_cmp);
    present
}

fn clip(values: &mut [f64], indices: impl Iterator<Item = usize>, lo: f64, hi: f64) -> usize {
    // f64::clamp panics on an inverted or NaN range
    if !(lo <= hi) {
        return 0;
    }
    let mut n = 0;
    for i in indices {
        let v = values[i];
        if v.is_nan() {
            continue;
        }
        let c = v.clamp(lo, hi);
        if c != v {
            values[i] = c;
            n += 1;
        }
    }
    n
}

/// Clip each column to its own `[lower, upper]` quantile range.
pub fn clip_global_percentile(table: &mut DailyTable, lower: f64, upper: f64) -> BTreeMap<String, usize> {
    let mut clipped = BTreeMap::new();
    for (name, values) in table.columns.iter_mut() {
        let sorted = sorted_present(values.iter().copied());
        let (Some(lo), Some(hi)) = (quantile(&sorted, lower), quantile(&sorted, upper)) else {
            continue;
        };
        let len = values.len();
        let n = clip(values, 0..len, lo, hi);
        if n > 0 {
            clipped.insert(name.clone(), n);
        }
    }
    clipped
}

fn group_key(lat: f64, lon: f64, group_by: GroupKey) -> (i64, i64) {
    match group_by {
        // + 0.0 folds -0.0 into 0.0
        GroupKey::Coordinate => ((lat + 0.0).to_bits() as i64, (lon + 0.0).to_bits() as i64),
        GroupKey::RoundedCoordinate { decimals } => (
            crate::spatial::round_key(lat, decimals),
            crate::spatial::round_key(lon, decimals),
        ),
    }
}

/// Clip to `[Q1 - k·IQR, Q3 + k·IQR]` within each group.
///
/// Returns per-variable clip counts and the number of (group, variable)
/// pairs skipped for being too small.
pub fn clip_grouped_iqr(table: &mut DailyTable, k: f64, group_by: GroupKey) -> (BTreeMap<String, usize>, usize) {
    let mut groups: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    for (i, (lat, lon)) in table.lat.iter().zip(&table.lon).enumerate() {
        groups.entry(group_key(*lat, *lon, group_by)).or_default().push(i);
    }

    let mut clipped = BTreeMap::new();
    let mut small = 0;

    for (name, values) in table.columns.iter_mut() {
        let mut n = 0;
        for rows in groups.values() {
            let sorted = sorted_present(rows.iter().map(|&i| values[i]));
            if sorted.len() < MIN_GROUP_SIZE {
                small += 1;
                continue;
            }
            let (Some(q1), Some(q3)) = (quantile(&sorted, 0.25), quantile(&sorted, 0.75)) else {
                continue;
            };
            let iqr = q3 - q1;
            n += clip(values, rows.iter().copied(), q1 - k * iqr, q3 + k * iqr);
        }
        if n > 0 {
            clipped.insert(name.clone(), n);
        }
    }

    (clipped, small)
}
