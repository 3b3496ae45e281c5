//! Staged batch upsert.
//!
//! One transaction per batch: rows are staged into a temp table, classified
//! against `vacancies` as new / changed / unchanged, then merged with one
//! `INSERT ... SELECT` and one `UPDATE ... FROM`. Unchanged rows are not
//! written. Any failure drops the transaction uncommitted.

use rusqlite::{params, Connection, Transaction};
use tracing::{error, info, info_span, warn};

use crate::companies::{CompanyMapping, CompanyResolver};
use crate::config::DEFAULT_PREVIEW_LIMIT;
use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::models::{UpsertReport, VacancyRecord};
use crate::staging::StagingArena;

const STAGING_TABLE: &str = "staging_vacancies";

const STAGING_COLUMNS: &str = "seq INTEGER PRIMARY KEY,
    vacancy_id TEXT NOT NULL,
    title TEXT NOT NULL,
    url TEXT,
    salary_from INTEGER,
    salary_to INTEGER,
    salary_currency TEXT,
    description TEXT,
    requirements TEXT,
    responsibilities TEXT,
    experience TEXT,
    employment TEXT,
    schedule TEXT,
    employer TEXT,
    employer_id TEXT,
    area TEXT,
    source TEXT,
    published_at TEXT,
    company_id INTEGER";

const MERGE_COLUMNS: &str = "vacancy_id, title, url, salary_from, salary_to, salary_currency,
    description, requirements, responsibilities, experience, employment, schedule,
    employer, employer_id, area, source, published_at, company_id";

/// Latest staged row per vacancy_id; a later duplicate in the batch wins.
fn latest_staged() -> String {
    format!(
        "(SELECT * FROM temp.{STAGING_TABLE} s
          WHERE s.seq = (SELECT MAX(d.seq) FROM temp.{STAGING_TABLE} d
                         WHERE d.vacancy_id = s.vacancy_id))"
    )
}

const CHANGED_PREDICATE: &str = "(v.title IS NOT l.title
    OR v.url IS NOT l.url
    OR v.description IS NOT l.description
    OR v.salary_from IS NOT l.salary_from
    OR v.salary_to IS NOT l.salary_to
    OR v.salary_currency IS NOT l.salary_currency
    OR v.company_id IS NOT l.company_id)";

pub struct BatchUpserter {
    resolver: CompanyResolver,
    preview_limit: usize,
}

impl Default for BatchUpserter {
    fn default() -> Self {
        Self::new(CompanyResolver::default(), DEFAULT_PREVIEW_LIMIT)
    }
}

impl BatchUpserter {
    pub fn new(resolver: CompanyResolver, preview_limit: usize) -> Self {
        Self {
            resolver,
            preview_limit,
        }
    }

    pub fn resolver(&self) -> &CompanyResolver {
        &self.resolver
    }

    /// Loads the company mapping inside the batch transaction.
    pub fn upsert(
        &self,
        db: &mut Database,
        records: Vec<VacancyRecord>,
    ) -> StoreResult<UpsertReport> {
        self.run(db.connection_mut(), records, None)
    }

    /// For callers that already built this batch's mapping.
    pub fn upsert_with_mapping(
        &self,
        db: &mut Database,
        records: Vec<VacancyRecord>,
        mapping: &CompanyMapping,
    ) -> StoreResult<UpsertReport> {
        self.run(db.connection_mut(), records, Some(mapping))
    }

    fn run(
        &self,
        conn: &mut Connection,
        records: Vec<VacancyRecord>,
        mapping: Option<&CompanyMapping>,
    ) -> StoreResult<UpsertReport> {
        if records.is_empty() {
            return Ok(UpsertReport::default());
        }
        let span = info_span!("upsert_batch", batch = records.len());
        let _enter = span.enter();

        let tx = conn.transaction().map_err(StoreError::write("begin"))?;
        match self.merge(&tx, records, mapping) {
            Ok(report) => {
                tx.commit().map_err(StoreError::write("commit"))?;
                info!(
                    inserted = report.inserted,
                    updated = report.updated,
                    unchanged = report.unchanged,
                    skipped = report.skipped,
                    "batch committed"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "batch upsert failed, rolling back");
                if let Err(rollback) = tx.rollback() {
                    error!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    fn merge(
        &self,
        tx: &Transaction<'_>,
        records: Vec<VacancyRecord>,
        mapping: Option<&CompanyMapping>,
    ) -> StoreResult<UpsertReport> {
        let loaded;
        let mapping = match mapping {
            Some(mapping) => mapping,
            None => {
                loaded = self.resolver.load_mapping(tx)?;
                &loaded
            }
        };

        let arena = StagingArena::create(tx, STAGING_TABLE, STAGING_COLUMNS)
            .map_err(StoreError::write("create staging"))?;
        arena
            .index_on("vacancy_id")
            .map_err(StoreError::write("create staging"))?;

        let skipped = stage_rows(tx, records, mapping)?;

        let latest = latest_staged();
        let new_rows = select_id_title(
            tx,
            &format!(
                "SELECT l.vacancy_id, l.title FROM {latest} AS l
                 WHERE NOT EXISTS (SELECT 1 FROM vacancies v WHERE v.vacancy_id = l.vacancy_id)
                 ORDER BY l.seq"
            ),
        )
        .map_err(StoreError::write("classify new"))?;
        let changed_rows = select_id_title(
            tx,
            &format!(
                "SELECT l.vacancy_id, l.title FROM {latest} AS l
                 JOIN vacancies v ON v.vacancy_id = l.vacancy_id
                 WHERE {CHANGED_PREDICATE}
                 ORDER BY l.seq"
            ),
        )
        .map_err(StoreError::write("classify changed"))?;
        let distinct_staged: i64 = tx
            .query_row(
                &format!("SELECT COUNT(DISTINCT vacancy_id) FROM temp.{STAGING_TABLE}"),
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::write("classify unchanged"))?;

        if !new_rows.is_empty() {
            tx.execute(
                &format!(
                    "INSERT INTO vacancies ({MERGE_COLUMNS})
                     SELECT {MERGE_COLUMNS} FROM {latest} AS l
                     WHERE NOT EXISTS (SELECT 1 FROM vacancies v WHERE v.vacancy_id = l.vacancy_id)
                     ORDER BY l.seq"
                ),
                [],
            )
            .map_err(StoreError::write("insert new"))?;
        }

        if !changed_rows.is_empty() {
            tx.execute(
                &format!(
                    "UPDATE vacancies AS v SET
                         title = l.title,
                         url = l.url,
                         salary_from = l.salary_from,
                         salary_to = l.salary_to,
                         salary_currency = l.salary_currency,
                         description = l.description,
                         requirements = l.requirements,
                         responsibilities = l.responsibilities,
                         experience = l.experience,
                         employment = l.employment,
                         schedule = l.schedule,
                         employer = l.employer,
                         employer_id = l.employer_id,
                         area = l.area,
                         source = l.source,
                         published_at = l.published_at,
                         company_id = l.company_id,
                         updated_at = datetime('now')
                     FROM {latest} AS l
                     WHERE v.vacancy_id = l.vacancy_id AND {CHANGED_PREDICATE}"
                ),
                [],
            )
            .map_err(StoreError::write("update changed"))?;
        }

        arena
            .discard()
            .map_err(StoreError::write("discard staging"))?;

        let inserted = new_rows.len();
        let updated = changed_rows.len();
        Ok(UpsertReport {
            inserted,
            updated,
            unchanged: (distinct_staged as usize).saturating_sub(inserted + updated),
            skipped,
            messages: self.preview(&new_rows, &changed_rows),
        })
    }

    fn preview(
        &self,
        new_rows: &[(String, String)],
        changed_rows: &[(String, String)],
    ) -> Vec<String> {
        let messages = new_rows
            .iter()
            .map(|(id, title)| format!("New vacancy {id}: '{title}'"))
            .chain(
                changed_rows
                    .iter()
                    .map(|(id, title)| format!("Vacancy {id} updated: '{title}'")),
            );
        let total = new_rows.len() + changed_rows.len();
        let mut preview: Vec<String> = messages.take(self.preview_limit).collect();
        if total > self.preview_limit {
            preview.push(format!("... and {} more", total - self.preview_limit));
        }
        preview
    }
}

/// Resolves and stages every valid record; returns how many were rejected.
fn stage_rows(
    tx: &Transaction<'_>,
    records: Vec<VacancyRecord>,
    mapping: &CompanyMapping,
) -> StoreResult<usize> {
    let mut stmt = tx
        .prepare(&format!(
            "INSERT INTO temp.{STAGING_TABLE} (seq, {MERGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                     ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        ))
        .map_err(StoreError::write("stage rows"))?;

    let mut skipped = 0;
    for (seq, mut record) in records.into_iter().enumerate() {
        if let Some(field) = record.missing_required_field() {
            warn!(
                source_id = %record.source_id,
                field,
                "dropping record with missing required field"
            );
            skipped += 1;
            continue;
        }
        record.company_id = mapping.resolve(&record.employer, record.source.as_deref());

        stmt.execute(params![
            seq as i64,
            record.source_id.trim(),
            record.title.trim(),
            record.url.trim(),
            record.salary_from(),
            record.salary_to(),
            non_blank(record.salary_currency()),
            non_blank(record.description.as_deref()),
            non_blank(record.requirements.as_deref()),
            non_blank(record.responsibilities.as_deref()),
            non_blank(record.experience.as_deref()),
            non_blank(record.employment.as_deref()),
            non_blank(record.schedule.as_deref()),
            non_blank(Some(record.employer.name.as_str())),
            non_blank(record.employer.external_id.as_deref()),
            non_blank(record.area.as_deref()),
            non_blank(record.source.as_deref()),
            record.published_at.map(|dt| dt.to_rfc3339()),
            record.company_id,
        ])
        .map_err(StoreError::write("stage rows"))?;
    }
    Ok(skipped)
}

fn select_id_title(tx: &Transaction<'_>, sql: &str) -> rusqlite::Result<Vec<(String, String)>> {
    let mut stmt = tx.prepare(sql)?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
