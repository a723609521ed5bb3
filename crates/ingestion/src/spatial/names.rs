//! Bilingual admin name resolution.
//!
//! Candidate values are scanned in preference order. A value written in the
//! preferred script wins; otherwise the first non-empty value is used when
//! fallback is allowed, and counted as a fallback.

use crate::config::ScriptRange;

/// Placeholder strings treated as missing, compared case-insensitively.
const PLACEHOLDERS: &[&str] = &["", "na", "n/a", "nan", "<na>", "none", "null"];

/// Trim `raw` and map placeholder tokens to `None`.
pub fn normalize_name(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    let lower = trimmed.to_lowercase();
    if PLACEHOLDERS.contains(&lower.as_str()) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// A resolved name and whether it came from the fallback scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub name: String,
    pub fallback: bool,
}

/// Pick a name from candidates.
pub fn choose_name<'a>(
    candidates: impl IntoIterator<Item = Option<&'a str>>,
    script: &ScriptRange,
    allow_fallback: bool,
) -> Option<Resolved> {
    let values: Vec<String> = candidates
        .into_iter()
        .filter_map(normalize_name)
        .collect();

    if let Some(name) = values.iter().find(|v| script.matches(v)) {
        return Some(Resolved {
            name: name.clone(),
            fallback: false,
        });
    }

    if allow_fallback {
        return values.into_iter().next().map(|name| Resolved {
            name,
            fallback: true,
        });
    }
    None
}

/// Names for one location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminNames {
    pub province: Option<String>,
    pub city: Option<String>,
    pub admin_name: Option<String>,
}

impl AdminNames {
    pub fn is_resolved(&self) -> bool {
        self.province.is_some() || self.city.is_some()
    }
}

/// Fallback bookkeeping for a mapping run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackStats {
    /// Rows whose province or city used a fallback value.
    pub fallback_rows: usize,
    /// Up to `sample_limit` resolved (province, city) pairs that used fallback.
    pub samples: Vec<(Option<String>, Option<String>)>,
    sample_limit: usize,
}

impl FallbackStats {
    pub fn new(sample_limit: usize) -> Self {
        Self {
            sample_limit,
            ..Self::default()
        }
    }

    /// Count `rows` rows sharing one fallback resolution.
    pub fn note(&mut self, names: &AdminNames, rows: usize) {
        self.fallback_rows += rows;
        if self.samples.len() < self.sample_limit {
            self.samples
                .push((names.province.clone(), names.city.clone()));
        }
    }
}

/// Resolves province, city and admin label from candidate values.
#[derive(Debug, Clone)]
pub struct NameResolver {
    script: ScriptRange,
    allow_fallback: bool,
}

impl NameResolver {
    pub fn new(script: ScriptRange, allow_fallback: bool) -> Self {
        Self {
            script,
            allow_fallback,
        }
    }

    /// Resolve one location. `existing_label` is an admin label column value
    /// from the polygon source, if it has one.
    ///
    /// The flag is set when province or city came from the fallback scan.
    pub fn resolve<'a>(
        &self,
        province: impl IntoIterator<Item = Option<&'a str>>,
        city: impl IntoIterator<Item = Option<&'a str>>,
        existing_label: Option<&str>,
    ) -> (AdminNames, bool) {
        let province = choose_name(province, &self.script, self.allow_fallback);
        let city = choose_name(city, &self.script, self.allow_fallback);
        let used_fallback = province.as_ref().is_some_and(|r| r.fallback)
            || city.as_ref().is_some_and(|r| r.fallback);

        let province = province.map(|r| r.name);
        let city = city.map(|r| r.name);
        let admin_name = normalize_name(existing_label)
            .or_else(|| city.clone())
            .or_else(|| province.clone());

        let names = AdminNames {
            province,
            city,
            admin_name,
        };
        (names, used_fallback)
    }
}
