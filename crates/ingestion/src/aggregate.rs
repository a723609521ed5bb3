//! Per-admin-unit aggregation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::spatial::MappedTable;

/// Spatial resolution of a persisted day table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One row per grid cell.
    Grid,
    /// One row per (province, city).
    City,
    /// One row per province.
    Province,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grid => "grid",
            Self::City => "city",
            Self::Province => "province",
        }
    }

    /// Whether this granularity needs the admin mapping.
    pub fn is_admin(&self) -> bool {
        !matches!(self, Self::Grid)
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "grid" => Ok(Self::Grid),
            "city" => Ok(Self::City),
            "province" => Ok(Self::Province),
            other => Err(format!("unknown granularity: {}", other)),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Group key: snapshot label (long layout only), province, city.
type GroupKey = (Option<String>, Option<String>, Option<String>);

/// One row per admin unit, ordered by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdminAggregate {
    pub time: Option<Vec<String>>,
    pub province: Vec<Option<String>>,
    /// Only filled at city granularity.
    pub city: Option<Vec<Option<String>>>,
    pub admin_name: Vec<Option<String>>,
    pub admin_level: String,
    /// Contributing grid cells per group.
    pub cells: Vec<u64>,
    pub columns: BTreeMap<String, Vec<f64>>,
}

impl AdminAggregate {
    pub fn row_count(&self) -> usize {
        self.province.len()
    }
}

#[derive(Default)]
struct Accumulator {
    rows: usize,
    sums: Vec<f64>,
    counts: Vec<u32>,
}

/// Mean of every variable per admin unit, ignoring missing values.
pub fn aggregate_by_admin(mapped: &MappedTable, granularity: Granularity) -> AdminAggregate {
    let table = &mapped.table;
    let names: Vec<&String> = table.columns.keys().collect();
    let by_city = granularity == Granularity::City;

    let mut groups: BTreeMap<GroupKey, Accumulator> = BTreeMap::new();
    for row in 0..table.row_count() {
        let key = (
            table.time.as_ref().map(|t| t[row].clone()),
            mapped.province[row].clone(),
            if by_city { mapped.city[row].clone() } else { None },
        );
        let acc = groups.entry(key).or_insert_with(|| Accumulator {
            rows: 0,
            sums: vec![0.0; names.len()],
            counts: vec![0; names.len()],
        });
        acc.rows += 1;
        for (i, name) in names.iter().enumerate() {
            let v = table.columns[*name][row];
            if !v.is_nan() {
                acc.sums[i] += v;
                acc.counts[i] += 1;
            }
        }
    }

    let mut out = AdminAggregate {
        time: table.time.as_ref().map(|_| Vec::with_capacity(groups.len())),
        city: by_city.then(|| Vec::with_capacity(groups.len())),
        admin_level: granularity.as_str().to_string(),
        columns: names
            .iter()
            .map(|n| ((*n).clone(), Vec::with_capacity(groups.len())))
            .collect(),
        ..AdminAggregate::default()
    };

    for ((time, province, city), acc) in groups {
        if let (Some(times), Some(t)) = (out.time.as_mut(), time) {
            times.push(t);
        }
        let label = if by_city {
            city.clone().or_else(|| province.clone())
        } else {
            province.clone()
        };
        out.admin_name.push(label);
        out.province.push(province);
        if let Some(cities) = out.city.as_mut() {
            cities.push(city);
        }
        out.cells.push(acc.rows as u64);
        for (i, name) in names.iter().enumerate() {
            let mean = if acc.counts[i] == 0 {
                f64::NAN
            } else {
                acc.sums[i] / f64::from(acc.counts[i])
            };
            if let Some(column) = out.columns.get_mut(*name) {
                column.push(mean);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::MappingStats;
    use crate::temporal::DailyTable;

    fn mapped() -> MappedTable {
        let s = |v: &str| Some(v.to_string());
        MappedTable {
            table: DailyTable {
                lat: vec![0.0; 4],
                lon: vec![0.0; 4],
                time: None,
                columns: BTreeMap::from([(
                    "pm25".to_string(),
                    vec![10.0, 20.0, f64::NAN, 40.0],
                )]),
            },
            province: vec![s("广东"), s("广东"), s("广东"), s("广西")],
            city: vec![s("深圳"), s("广州"), s("广州"), s("南宁")],
            admin_name: vec![s("深圳"), s("广州"), s("广州"), s("南宁")],
            admin_level: "city".to_string(),
            stats: MappingStats::default(),
        }
    }

    #[test]
    fn test_city_groups_sorted() {
        let agg = aggregate_by_admin(&mapped(), Granularity::City);
        assert_eq!(agg.row_count(), 3);
        let cities = agg.city.as_ref().unwrap();
        assert_eq!(cities[0].as_deref(), Some("广州"));
        assert_eq!(cities[1].as_deref(), Some("深圳"));
        assert_eq!(cities[2].as_deref(), Some("南宁"));
        assert_eq!(agg.columns["pm25"], vec![20.0, 10.0, 40.0]);
        assert_eq!(agg.cells, vec![2, 1, 1]);
    }

    #[test]
    fn test_province_groups() {
        let agg = aggregate_by_admin(&mapped(), Granularity::Province);
        assert_eq!(agg.row_count(), 2);
        assert!(agg.city.is_none());
        assert_eq!(agg.admin_name[0].as_deref(), Some("广东"));
        assert_eq!(agg.columns["pm25"], vec![15.0, 40.0]);
    }

    #[test]
    fn test_granularity_parse() {
        assert_eq!("City".parse::<Granularity>().unwrap(), Granularity::City);
        assert!("county".parse::<Granularity>().is_err());
        assert!(!Granularity::Grid.is_admin());
    }
}
