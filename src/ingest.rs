//! Ingestion boundary and pipeline.
//!
//! Job-board payloads arrive as loosely shaped JSON: HeadHunter nests salary
//! and employer in objects, SuperJob flattens them (`payment_from`,
//! `firm_name`, `id_client`) and uses unix timestamps. [`RawVacancy`] accepts
//! both and normalizes into [`VacancyRecord`]; [`Pipeline`] then runs the
//! resolve, filter, dedup and upsert stages over a batch.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, info_span, warn};

use crate::dedup;
use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::filter::{self, FilterCriteria};
use crate::models::{canonical_source, Employer, Salary, UpsertReport, VacancyRecord};
use crate::upsert::BatchUpserter;

static MARKUP: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"<[^>]*>").ok());

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Text(String),
    Number(i64),
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Text(s) => f.write_str(s.trim()),
            IdValue::Number(n) => write!(f, "{n}"),
        }
    }
}

/// `"Москва"` or `{"id": "1", "name": "Москва"}` / `{"title": "Москва"}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Labeled {
    Text(String),
    Object {
        name: Option<String>,
        title: Option<String>,
    },
}

impl Labeled {
    fn into_label(self) -> Option<String> {
        match self {
            Labeled::Text(text) => Some(text),
            Labeled::Object { name, title } => name.or(title),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawEmployer {
    Name(String),
    Object {
        id: Option<IdValue>,
        name: Option<String>,
        title: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSalary {
    pub from: Option<Value>,
    pub to: Option<Value>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSnippet {
    pub requirement: Option<String>,
    pub responsibility: Option<String>,
}

/// One vacancy as delivered by a job board.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawVacancy {
    #[serde(alias = "source_id")]
    pub vacancy_id: Option<IdValue>,
    pub id: Option<IdValue>,

    pub title: Option<String>,
    pub name: Option<String>,
    pub profession: Option<String>,

    pub alternate_url: Option<String>,
    pub link: Option<String>,
    pub url: Option<String>,

    pub salary: Option<RawSalary>,
    #[serde(alias = "payment_from")]
    pub salary_from: Option<Value>,
    #[serde(alias = "payment_to")]
    pub salary_to: Option<Value>,
    #[serde(alias = "salary_currency")]
    pub currency: Option<String>,

    pub description: Option<String>,
    #[serde(rename = "vacancyRichText")]
    pub rich_text: Option<String>,
    pub snippet: Option<RawSnippet>,
    #[serde(alias = "candidat")]
    pub requirements: Option<String>,
    #[serde(alias = "work")]
    pub responsibilities: Option<String>,

    pub experience: Option<Labeled>,
    #[serde(alias = "type_of_work")]
    pub employment: Option<Labeled>,
    #[serde(alias = "place_of_work")]
    pub schedule: Option<Labeled>,
    #[serde(alias = "town")]
    pub area: Option<Labeled>,

    pub employer: Option<RawEmployer>,
    pub client: Option<RawEmployer>,
    pub firm_name: Option<String>,
    pub id_client: Option<IdValue>,

    pub source: Option<String>,
    #[serde(alias = "date_published")]
    pub published_at: Option<Value>,
}

impl RawVacancy {
    /// Normalizes the payload; `default_source` applies when it carries none.
    pub fn into_record(self, default_source: Option<&str>) -> StoreResult<VacancyRecord> {
        let source_id = self
            .vacancy_id
            .or(self.id)
            .map(|id| id.to_string())
            .unwrap_or_default();
        let title = first_present([self.title, self.name, self.profession]).unwrap_or_default();
        let url = first_present([self.alternate_url, self.link, self.url]).unwrap_or_default();

        let salary = {
            let nested = self.salary.unwrap_or_default();
            let salary = Salary {
                from: nested.from.as_ref().or(self.salary_from.as_ref()).and_then(parse_amount),
                to: nested.to.as_ref().or(self.salary_to.as_ref()).and_then(parse_amount),
                currency: clean(nested.currency.or(self.currency)),
            };
            (!salary.is_empty()).then_some(salary)
        };

        let snippet = self.snippet.unwrap_or_default();
        let requirements = clean_markup(snippet.requirement.or(self.requirements));
        let responsibilities =
            clean_markup(snippet.responsibility.or(self.responsibilities.clone()));
        let description = clean_markup(self.description).or_else(|| {
            let parts: Vec<String> = [self.rich_text, self.responsibilities]
                .into_iter()
                .filter_map(clean_markup)
                .collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        });

        let employer = employer_of(self.employer, self.client, self.firm_name, self.id_client);
        let source = clean(self.source)
            .or_else(|| default_source.map(str::to_string))
            .map(|s| canonical_source(&s));

        let record = VacancyRecord {
            source_id,
            title: title.trim().to_string(),
            url: url.trim().to_string(),
            salary,
            description,
            requirements,
            responsibilities,
            experience: self.experience.and_then(Labeled::into_label).and_then(|s| clean(Some(s))),
            employment: self.employment.and_then(Labeled::into_label).and_then(|s| clean(Some(s))),
            schedule: self.schedule.and_then(Labeled::into_label).and_then(|s| clean(Some(s))),
            area: self.area.and_then(Labeled::into_label).and_then(|s| clean(Some(s))),
            source,
            published_at: self.published_at.as_ref().and_then(parse_published),
            employer,
            company_id: None,
        };

        match record.missing_required_field() {
            Some(field) => Err(StoreError::InvalidRecord {
                source_id: record.source_id,
                field,
            }),
            None => Ok(record),
        }
    }
}

fn employer_of(
    employer: Option<RawEmployer>,
    client: Option<RawEmployer>,
    firm_name: Option<String>,
    id_client: Option<IdValue>,
) -> Employer {
    let (mut name, mut external_id) = (None, None);
    for raw in [employer, client].into_iter().flatten() {
        match raw {
            RawEmployer::Name(text) => name = name.or(clean(Some(text))),
            RawEmployer::Object { id, name: n, title } => {
                name = name.or(clean(n.or(title)));
                external_id = external_id.or(id.map(|id| id.to_string()));
            }
        }
    }
    Employer {
        name: name.or(clean(firm_name)).unwrap_or_default(),
        external_id: external_id
            .or(id_client.map(|id| id.to_string()))
            .filter(|id| !id.is_empty() && id != "0"),
    }
}

/// Accepts RFC 3339, `+0300`-style offsets, naive timestamps (taken as UTC)
/// and unix seconds. Anything else is dropped.
pub fn parse_published(value: &Value) -> Option<DateTime<Utc>> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        Value::String(s) => parse_timestamp_text(s.trim()),
        _ => None,
    };
    if parsed.is_none() && !value.is_null() {
        debug!(value = %value, "unparseable publication date");
    }
    parsed
}

fn parse_timestamp_text(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    s.parse::<i64>().ok().and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Zero means "not specified" on both boards.
fn parse_amount(value: &Value) -> Option<i64> {
    let amount = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    amount.filter(|a| *a > 0)
}

fn first_present<const N: usize>(candidates: [Option<String>; N]) -> Option<String> {
    candidates.into_iter().flatten().find(|s| !s.trim().is_empty())
}

fn clean(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Strips highlight tags and the entities HeadHunter leaves in snippets.
fn clean_markup(value: Option<String>) -> Option<String> {
    let text = clean(value)?;
    let stripped = match MARKUP.as_ref() {
        Some(re) => re.replace_all(&text, "").into_owned(),
        None => text,
    };
    let decoded = stripped
        .replace("&quot;", "\"")
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    clean(Some(decoded))
}

#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub records: Vec<VacancyRecord>,
    pub rejected: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    List(Vec<Value>),
    Items { items: Vec<Value> },
    Objects { objects: Vec<Value> },
}

/// Parses a JSON array of payloads, or an API response wrapping one in
/// `items` (HeadHunter) or `objects` (SuperJob). Only a malformed document is
/// an error; individual bad payloads are counted in `rejected`.
pub fn parse_batch(json: &str, default_source: Option<&str>) -> serde_json::Result<ParsedBatch> {
    let payloads = match serde_json::from_str::<Envelope>(json)? {
        Envelope::List(items)
        | Envelope::Items { items }
        | Envelope::Objects { objects: items } => items,
    };

    let mut batch = ParsedBatch::default();
    for (index, payload) in payloads.into_iter().enumerate() {
        let result = serde_json::from_value::<RawVacancy>(payload)
            .map_err(|e| e.to_string())
            .and_then(|raw| raw.into_record(default_source).map_err(|e| e.to_string()));
        match result {
            Ok(record) => batch.records.push(record),
            Err(reason) => {
                warn!(index, %reason, "rejecting payload");
                batch.rejected += 1;
            }
        }
    }
    info!(
        accepted = batch.records.len(),
        rejected = batch.rejected,
        "payloads parsed"
    );
    Ok(batch)
}

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub deduplicate: bool,
    pub criteria: Option<FilterCriteria>,
}

/// Resolve, then optionally filter and deduplicate, then upsert.
pub struct Pipeline {
    upserter: BatchUpserter,
}

impl Pipeline {
    pub fn new(upserter: BatchUpserter) -> Self {
        Self { upserter }
    }

    pub fn run(
        &self,
        db: &mut Database,
        mut records: Vec<VacancyRecord>,
        options: &IngestOptions,
    ) -> StoreResult<UpsertReport> {
        if records.is_empty() {
            return Ok(UpsertReport::default());
        }
        let span = info_span!("ingest", received = records.len());
        let _enter = span.enter();

        let resolver = self.upserter.resolver();
        let mapping = resolver.load_mapping(db.connection())?;
        let resolved = resolver.annotate(&mapping, &mut records);
        info!(resolved, total = records.len(), "companies resolved");

        if let Some(criteria) = options.criteria.as_ref().filter(|c| !c.is_empty()) {
            records = filter::apply(records, criteria);
        }
        if options.deduplicate {
            records = dedup::deduplicate(&mut *db, records);
        }
        self.upserter.upsert_with_mapping(db, records, &mapping)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(BatchUpserter::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const HH_RESPONSE: &str = r#"{
        "items": [
            {
                "id": "93353083",
                "name": "Python-разработчик",
                "url": "https://api.hh.ru/vacancies/93353083",
                "alternate_url": "https://hh.ru/vacancy/93353083",
                "salary": {"from": 150000, "to": null, "currency": "RUR", "gross": false},
                "snippet": {
                    "requirement": "Опыт работы с <highlighttext>Python</highlighttext> от 3 лет",
                    "responsibility": "Разработка &quot;бэкенда&quot;"
                },
                "employer": {"id": "1740", "name": "Яндекс"},
                "area": {"id": "1", "name": "Москва"},
                "experience": {"id": "between3And6", "name": "От 3 до 6 лет"},
                "schedule": {"id": "remote", "name": "Удаленная работа"},
                "published_at": "2024-01-15T10:30:00+0300"
            },
            {"id": "2", "name": "", "alternate_url": "https://hh.ru/vacancy/2"}
        ],
        "found": 2
    }"#;

    fn sj_payload() -> Value {
        json!({
            "id": 46512875,
            "profession": "Java Developer",
            "link": "https://www.superjob.ru/vakansii/java-developer-46512875.html",
            "payment_from": 0,
            "payment_to": 250000,
            "currency": "rub",
            "candidat": "Java 17, Spring",
            "work": "Поддержка сервисов",
            "vacancyRichText": "<p>Команда платформы</p>",
            "firm_name": "Тинькофф",
            "id_client": 78638,
            "town": {"id": 4, "title": "Москва"},
            "type_of_work": {"id": 6, "title": "Полный рабочий день"},
            "date_published": 1705300000
        })
    }

    #[test]
    fn parses_headhunter_response() {
        let batch = parse_batch(HH_RESPONSE, Some("hh.ru")).unwrap();
        assert_eq!(batch.rejected, 1);
        let record = &batch.records[0];
        assert_eq!(record.source_id, "93353083");
        assert_eq!(record.url, "https://hh.ru/vacancy/93353083");
        assert_eq!(record.salary_from(), Some(150_000));
        assert_eq!(record.salary_to(), None);
        assert_eq!(record.requirements.as_deref(), Some("Опыт работы с Python от 3 лет"));
        assert_eq!(record.responsibilities.as_deref(), Some("Разработка \"бэкенда\""));
        assert_eq!(record.employer.name, "Яндекс");
        assert_eq!(record.employer.external_id.as_deref(), Some("1740"));
        assert_eq!(record.area.as_deref(), Some("Москва"));
        assert_eq!(record.source.as_deref(), Some("hh"));
        assert_eq!(
            record.published_at,
            Utc.with_ymd_and_hms(2024, 1, 15, 7, 30, 0).single()
        );
    }

    #[test]
    fn parses_superjob_payload() {
        let raw: RawVacancy = serde_json::from_value(sj_payload()).unwrap();
        let record = raw.into_record(Some("superjob")).unwrap();
        assert_eq!(record.source_id, "46512875");
        assert_eq!(record.title, "Java Developer");
        assert_eq!(record.salary_from(), None);
        assert_eq!(record.salary_to(), Some(250_000));
        assert_eq!(record.salary_currency(), Some("rub"));
        assert_eq!(record.requirements.as_deref(), Some("Java 17, Spring"));
        assert_eq!(record.description.as_deref(), Some("Команда платформы Поддержка сервисов"));
        assert_eq!(record.employer.name, "Тинькофф");
        assert_eq!(record.employer.external_id.as_deref(), Some("78638"));
        assert_eq!(record.employment.as_deref(), Some("Полный рабочий день"));
        assert_eq!(record.source.as_deref(), Some("superjob"));
        assert_eq!(record.published_at, DateTime::from_timestamp(1_705_300_000, 0));
    }

    #[test]
    fn employer_may_be_plain_text() {
        let raw: RawVacancy = serde_json::from_value(json!({
            "vacancy_id": 5,
            "title": "QA",
            "url": "https://example.com/5",
            "employer": "  Авито  "
        }))
        .unwrap();
        let record = raw.into_record(None).unwrap();
        assert_eq!(record.employer, Employer::named("Авито"));
        assert_eq!(record.source, None);
    }

    #[test]
    fn missing_url_is_rejected() {
        let raw: RawVacancy = serde_json::from_value(json!({"id": "9", "name": "Dev"})).unwrap();
        let err = raw.into_record(None).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { field: "url", .. }));
    }

    #[test]
    fn publication_dates_in_several_shapes() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single();
        assert_eq!(parse_published(&json!("2024-03-01T12:00:00Z")), expected);
        assert_eq!(parse_published(&json!("2024-03-01T15:00:00+0300")), expected);
        assert_eq!(parse_published(&json!("2024-03-01 12:00:00")), expected);
        assert_eq!(parse_published(&json!(1_709_294_400)), expected);
        assert_eq!(parse_published(&json!("yesterday")), None);
        assert_eq!(parse_published(&Value::Null), None);
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(parse_batch("{\"found\": 0}", None).is_err());
        assert!(parse_batch("not json", None).is_err());
    }

    #[test]
    fn pipeline_resolves_filters_dedups_and_upserts() {
        let mut db = Database::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        db.seed_target_companies().unwrap();

        let payload = json!([
            {"id": "1", "name": "Python Developer", "alternate_url": "https://hh.ru/vacancy/1",
             "employer": {"id": "1740", "name": "Yandex LLC"}, "salary": {"from": 200000}},
            {"id": "2", "name": "  python   developer!!",
             "alternate_url": "https://hh.ru/vacancy/2",
             "employer": {"id": "1740", "name": "yandex llc"}, "salary": {"from": 210000}},
            {"id": "3", "name": "Python Developer", "alternate_url": "https://hh.ru/vacancy/3",
             "employer": "Startup", "salary": {"from": 50000}}
        ]);
        let batch = parse_batch(&payload.to_string(), Some("hh")).unwrap();
        assert_eq!(batch.records.len(), 3);

        let options = IngestOptions {
            deduplicate: true,
            criteria: Some(FilterCriteria {
                min_salary: Some(100_000),
                ..Default::default()
            }),
        };
        let report = Pipeline::default().run(&mut db, batch.records, &options).unwrap();
        assert_eq!(report.inserted, 1);

        let stored = db.get_vacancy("1").unwrap();
        assert_eq!(stored.company_name.as_deref(), Some("Яндекс"));
        assert!(db.get_vacancy("2").is_none());
        assert!(db.get_vacancy("3").is_none());
    }

    #[test]
    fn pipeline_with_empty_batch_touches_nothing() {
        let mut db = Database::open_in_memory().unwrap();
        let report = Pipeline::default()
            .run(&mut db, Vec::new(), &IngestOptions::default())
            .unwrap();
        assert_eq!(report, UpsertReport::default());
    }
}
