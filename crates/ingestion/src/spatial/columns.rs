//! Mapping polygon attribute columns onto canonical admin fields.
//!
//! Polygon sources name their columns inconsistently (`NAME_1`, `province`,
//! `ADM1_NAME`, ...) and the join may add `_right` suffixes. Each canonical
//! field has an ordered list of exact names followed by substring tokens.

/// Canonical admin fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalField {
    Province,
    City,
    AdminLabel,
}

/// Acceptable source names for one canonical field.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub field: CanonicalField,
    /// Tried first, in order. A `_right` suffixed variant also matches.
    pub exact: &'static [&'static str],
    /// Case-insensitive substrings, tried in column order.
    pub tokens: &'static [&'static str],
}

pub const PROVINCE_RULE: FieldRule = FieldRule {
    field: CanonicalField::Province,
    exact: &["NL_NAME_1", "NAME_1", "province", "Province", "PROV", "ADM1_NAME"],
    tokens: &["nl_name_1", "name_1", "province", "prov", "adm1"],
};

pub const CITY_RULE: FieldRule = FieldRule {
    field: CanonicalField::City,
    exact: &["NL_NAME_2", "NAME_2", "city", "City", "ADM2_NAME"],
    tokens: &["nl_name_2", "name_2", "city", "adm2", "cnty", "mun"],
};

pub const ADMIN_LABEL_RULE: FieldRule = FieldRule {
    field: CanonicalField::AdminLabel,
    exact: &["admin_name", "ADMIN_NAME", "ADM_NAME"],
    tokens: &[],
};

/// Candidate column indices per canonical field, in preference order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnResolution {
    pub province: Vec<usize>,
    pub city: Vec<usize>,
    pub admin_label: Option<usize>,
}

impl ColumnResolution {
    pub fn is_empty(&self) -> bool {
        self.province.is_empty() && self.city.is_empty() && self.admin_label.is_none()
    }
}

fn candidates(columns: &[String], rule: &FieldRule) -> Vec<usize> {
    let mut found: Vec<usize> = Vec::new();

    for name in rule.exact {
        let suffixed = format!("{}_right", name);
        for (i, col) in columns.iter().enumerate() {
            if (col == name || *col == suffixed) && !found.contains(&i) {
                found.push(i);
            }
        }
    }

    for (i, col) in columns.iter().enumerate() {
        let lower = col.to_lowercase();
        if rule.tokens.iter().any(|t| lower.contains(t)) && !found.contains(&i) {
            found.push(i);
        }
    }

    found
}

/// Resolve canonical fields against joined column names.
///
/// A column matching both province and city rules is kept for city only.
pub fn resolve_columns(columns: &[String]) -> ColumnResolution {
    let city = candidates(columns, &CITY_RULE);
    let province = candidates(columns, &PROVINCE_RULE)
        .into_iter()
        .filter(|i| !city.contains(i))
        .collect();
    let admin_label = candidates(columns, &ADMIN_LABEL_RULE).into_iter().next();

    ColumnResolution {
        province,
        city,
        admin_label,
    }
}
