//! Predicate filtering over vacancy lists.
//!
//! Every predicate is optional and they compose with AND. Criteria come from
//! loose input ([`RawCriteria`]); a value that cannot be parsed drops that one
//! predicate with a warning instead of failing the whole search.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::companies::normalize_name;
use crate::models::{canonical_source, Salary, SortMode, StoredVacancy, VacancyRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSet {
    pub company_ids: BTreeSet<i64>,
    pub names: BTreeSet<String>,
    /// source -> external employer ids allowed for that source
    pub external_ids: BTreeMap<String, BTreeSet<String>>,
}

impl TargetSet {
    pub fn is_empty(&self) -> bool {
        self.company_ids.is_empty() && self.names.is_empty() && self.external_ids.is_empty()
    }

    pub fn allow_external(&mut self, source: &str, external_id: impl Into<String>) {
        self.external_ids
            .entry(canonical_source(source))
            .or_default()
            .insert(external_id.into());
    }

    pub fn allow_name(&mut self, name: &str) {
        let name = normalize_name(name);
        if !name.is_empty() {
            self.names.insert(name);
        }
    }

    fn admits(&self, record: &VacancyRecord) -> bool {
        if self.is_empty() {
            return true;
        }
        if record.company_id.is_some_and(|id| self.company_ids.contains(&id)) {
            return true;
        }
        if let Some(external_id) = record.employer.external_id.as_deref() {
            let for_source = record
                .source
                .as_deref()
                .and_then(|s| self.external_ids.get(&canonical_source(s)));
            let allowed = match for_source {
                Some(ids) => ids.contains(external_id),
                None => self.external_ids.values().any(|ids| ids.contains(external_id)),
            };
            if allowed {
                return true;
            }
        }
        let name = normalize_name(&record.employer.name);
        !name.is_empty() && self.names.contains(&name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterCriteria {
    pub min_salary: Option<i64>,
    pub max_salary: Option<i64>,
    pub keywords: Vec<String>,
    pub targets: TargetSet,
    pub experience: Option<String>,
    pub employment: Option<String>,
    pub schedule: Option<String>,
    pub area: Option<String>,
    pub limit: Option<usize>,
    pub sort: Option<SortMode>,
}

/// Loosely typed criteria as they arrive from a CLI or a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawCriteria {
    #[serde(alias = "salary_from")]
    pub min_salary: Option<Value>,
    #[serde(alias = "salary_to")]
    pub max_salary: Option<Value>,
    pub keywords: Option<Vec<String>>,
    pub company_ids: Option<Vec<Value>>,
    pub company_names: Option<Vec<String>>,
    /// source -> external ids
    pub external_ids: Option<BTreeMap<String, Vec<String>>>,
    pub experience: Option<String>,
    pub employment: Option<String>,
    pub schedule: Option<String>,
    pub area: Option<String>,
    pub limit: Option<Value>,
    pub sort: Option<String>,
}

impl FilterCriteria {
    pub fn from_raw(raw: RawCriteria) -> Self {
        let mut criteria = Self {
            min_salary: raw.min_salary.as_ref().and_then(|v| parse_integer("min_salary", v)),
            max_salary: raw.max_salary.as_ref().and_then(|v| parse_integer("max_salary", v)),
            keywords: raw
                .keywords
                .unwrap_or_default()
                .into_iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            experience: non_blank(raw.experience),
            employment: non_blank(raw.employment),
            schedule: non_blank(raw.schedule),
            area: non_blank(raw.area),
            limit: raw
                .limit
                .as_ref()
                .and_then(|v| parse_integer("limit", v))
                .and_then(|n| usize::try_from(n).ok().filter(|n| *n > 0)),
            sort: raw.sort.as_deref().and_then(parse_sort),
            ..Default::default()
        };

        for value in raw.company_ids.unwrap_or_default() {
            if let Some(id) = parse_integer("company_ids", &value) {
                criteria.targets.company_ids.insert(id);
            }
        }
        for name in raw.company_names.unwrap_or_default() {
            criteria.targets.allow_name(&name);
        }
        for (source, ids) in raw.external_ids.unwrap_or_default() {
            for id in ids {
                criteria.targets.allow_external(&source, id);
            }
        }
        criteria
    }

    pub fn has_salary_bounds(&self) -> bool {
        self.min_salary.is_some() || self.max_salary.is_some()
    }

    /// True when nothing would constrain, reorder or truncate the input.
    pub fn is_empty(&self) -> bool {
        !self.has_predicates() && self.limit.is_none() && self.sort.is_none()
    }

    fn has_predicates(&self) -> bool {
        self.has_salary_bounds()
            || !self.keywords.is_empty()
            || !self.targets.is_empty()
            || self.experience.is_some()
            || self.employment.is_some()
            || self.schedule.is_some()
            || self.area.is_some()
    }

    pub fn matches(&self, record: &VacancyRecord) -> bool {
        self.salary_matches(record)
            && self.keywords_match(record)
            && self.targets.admits(record)
            && contains_ci(record.experience.as_deref(), self.experience.as_deref())
            && contains_ci(record.employment.as_deref(), self.employment.as_deref())
            && contains_ci(record.schedule.as_deref(), self.schedule.as_deref())
            && contains_ci(record.area.as_deref(), self.area.as_deref())
    }

    fn salary_matches(&self, record: &VacancyRecord) -> bool {
        if !self.has_salary_bounds() {
            return true;
        }
        let lo = self.min_salary.unwrap_or(i64::MIN);
        let hi = self.max_salary.unwrap_or(i64::MAX);
        [record.salary_from(), record.salary_to()]
            .into_iter()
            .flatten()
            .any(|amount| (lo..=hi).contains(&amount))
    }

    fn keywords_match(&self, record: &VacancyRecord) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let haystack = [
            Some(record.title.as_str()),
            record.description.as_deref(),
            record.requirements.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::to_lowercase)
        .collect::<Vec<_>>();
        self.keywords
            .iter()
            .any(|kw| haystack.iter().any(|field| field.contains(kw.as_str())))
    }
}

pub fn apply(records: Vec<VacancyRecord>, criteria: &FilterCriteria) -> Vec<VacancyRecord> {
    apply_by(records, criteria, |r| r)
}

pub fn apply_stored(rows: Vec<StoredVacancy>, criteria: &FilterCriteria) -> Vec<StoredVacancy> {
    apply_by(rows, criteria, |row| &row.record)
}

fn apply_by<T>(
    items: Vec<T>,
    criteria: &FilterCriteria,
    record_of: impl Fn(&T) -> &VacancyRecord,
) -> Vec<T> {
    if criteria.is_empty() {
        return items;
    }
    let before = items.len();
    let mut kept: Vec<T> = items
        .into_iter()
        .filter(|item| criteria.matches(record_of(item)))
        .collect();

    match criteria.sort {
        Some(SortMode::Salary) => {
            let ceiling = |item: &T| record_of(item).salary.as_ref().and_then(Salary::ceiling);
            kept.sort_by(|a, b| descending_nulls_last(ceiling(a), ceiling(b)))
        }
        Some(SortMode::Recency) => kept.sort_by(|a, b| {
            descending_nulls_last(record_of(a).published_at, record_of(b).published_at)
        }),
        None => {}
    }
    if let Some(limit) = criteria.limit {
        kept.truncate(limit);
    }
    debug!(before, after = kept.len(), "filter applied");
    kept
}

fn descending_nulls_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn contains_ci(field: Option<&str>, needle: Option<&str>) -> bool {
    match needle {
        None => true,
        Some(needle) => field.is_some_and(|f| f.to_lowercase().contains(&needle.to_lowercase())),
    }
}

fn parse_integer(field: &str, value: &Value) -> Option<i64> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let digits: String = s.chars().filter(|c| !c.is_whitespace() && *c != '_').collect();
            digits.parse::<i64>().ok()
        }
        Value::Null => return None,
        _ => None,
    };
    if parsed.is_none() {
        warn!(field, value = %value, "ignoring malformed filter value");
    }
    parsed
}

fn parse_sort(value: &str) -> Option<SortMode> {
    match value.trim().to_lowercase().as_str() {
        "salary" => Some(SortMode::Salary),
        "recency" | "date" | "recent" => Some(SortMode::Recency),
        "" => None,
        other => {
            warn!(value = other, "ignoring unknown sort mode");
            None
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
