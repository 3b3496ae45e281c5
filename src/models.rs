use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employer {
    pub name: String,
    pub external_id: Option<String>, // id on the originating job board
}

impl Employer {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            external_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salary {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub currency: Option<String>,
}

impl Salary {
    pub fn is_empty(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    /// Upper end of the range, used for salary sorting.
    pub fn ceiling(&self) -> Option<i64> {
        match (self.from, self.to) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VacancyRecord {
    pub source_id: String,
    pub title: String,
    pub url: String,
    pub salary: Option<Salary>,
    pub description: Option<String>,
    pub requirements: Option<String>,
    pub responsibilities: Option<String>,
    pub experience: Option<String>,
    pub employment: Option<String>,
    pub schedule: Option<String>,
    pub area: Option<String>,
    pub source: Option<String>, // "hh", "superjob", ...
    pub published_at: Option<DateTime<Utc>>,
    pub employer: Employer,
    pub company_id: Option<i64>,
}

impl VacancyRecord {
    pub fn new(
        source_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Name of the first required field that is blank, if any.
    pub fn missing_required_field(&self) -> Option<&'static str> {
        if self.source_id.trim().is_empty() {
            Some("source_id")
        } else if self.title.trim().is_empty() {
            Some("title")
        } else if self.url.trim().is_empty() {
            Some("url")
        } else {
            None
        }
    }

    pub fn salary_from(&self) -> Option<i64> {
        self.salary.as_ref().and_then(|s| s.from)
    }

    pub fn salary_to(&self) -> Option<i64> {
        self.salary.as_ref().and_then(|s| s.to)
    }

    pub fn salary_currency(&self) -> Option<&str> {
        self.salary.as_ref().and_then(|s| s.currency.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub id: i64,
    pub name: String,
    pub external_ids: BTreeMap<String, String>, // source -> id on that source
    pub aliases: Vec<String>,
}

/// A vacancy row as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredVacancy {
    pub id: i64,
    pub record: VacancyRecord,
    pub company_name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_vacancies: usize,
    pub vacancies_with_salary: usize,
    pub distinct_employers: usize,
    pub latest_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    #[default]
    Recency,
    Salary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub messages: Vec<String>,
}

impl UpsertReport {
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.updated == 0
    }
}

/// Folds the spellings job boards use for themselves into one tag.
pub fn canonical_source(source: &str) -> String {
    let lower = source.trim().to_lowercase();
    match lower.as_str() {
        "hh" | "hh.ru" | "headhunter" => "hh".to_string(),
        "sj" | "superjob" | "superjob.ru" => "superjob".to_string(),
        _ => lower,
    }
}
