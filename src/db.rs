use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use tracing::{error, info};

use crate::companies::{load_companies, AliasTable, TARGET_COMPANIES};
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::filter::{self, FilterCriteria};
use crate::models::{
    CompanyRecord, DatabaseStats, Employer, Salary, StoredVacancy, VacancyRecord,
};

const VACANCY_COLUMNS: &str = "v.id, v.vacancy_id, v.title, v.url, v.salary_from, v.salary_to,
     v.salary_currency, v.description, v.requirements, v.responsibilities, v.experience,
     v.employment, v.schedule, v.employer, v.employer_id, v.area, v.source, v.published_at,
     v.company_id, c.name, v.created_at, v.updated_at";

/// A vacancy's salary midpoint, or whichever end is known; NULL without salary.
const SALARY_MIDPOINT: &str = "CASE
         WHEN v.salary_from IS NOT NULL AND v.salary_to IS NOT NULL
             THEN (v.salary_from + v.salary_to) / 2.0
         ELSE COALESCE(v.salary_from, v.salary_to)
     END";

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(config: &Config) -> StoreResult<Self> {
        let path = config.database_path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::DataDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(&path).map_err(|source| StoreError::Connection {
            path: path.display().to_string(),
            source,
        })?;
        conn.busy_timeout(config.busy_timeout)?;
        Self::configure(conn, path)
    }

    pub fn open_at(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open(&Config::default().with_database_path(path.as_ref()))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Connection {
            path: ":memory:".to_string(),
            source,
        })?;
        Self::configure(conn, PathBuf::from(":memory:"))
    }

    fn configure(conn: Connection, path: PathBuf) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Creates tables and indexes that are missing. Never touches existing rows.
    pub fn ensure_schema(&self) -> StoreResult<()> {
        self.conn
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS companies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                external_id TEXT,
                source TEXT,
                url TEXT,
                logo_url TEXT,
                site_url TEXT,
                description TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS vacancies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vacancy_id TEXT NOT NULL UNIQUE,
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
                company_id INTEGER REFERENCES companies(id),
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_vacancies_company ON vacancies(company_id);
            CREATE INDEX IF NOT EXISTS idx_vacancies_title ON vacancies(title);
            CREATE INDEX IF NOT EXISTS idx_vacancies_salary ON vacancies(salary_from, salary_to);
            CREATE INDEX IF NOT EXISTS idx_vacancies_published ON vacancies(published_at);
            CREATE INDEX IF NOT EXISTS idx_companies_external ON companies(source, external_id);
            "#,
            )
            .map_err(StoreError::Schema)
    }

    // --- Company operations ---

    /// Inserts the built-in target companies; existing names are left alone.
    pub fn seed_target_companies(&mut self) -> StoreResult<usize> {
        let tx = self.conn.transaction().map_err(StoreError::write("begin"))?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO companies (name, external_id, source, description)
                     VALUES (?1, ?2, 'hh', ?3)",
                )
                .map_err(StoreError::write("seed companies"))?;
            for company in TARGET_COMPANIES {
                inserted += stmt
                    .execute(params![company.name, company.hh_id, company.description])
                    .map_err(StoreError::write("seed companies"))?;
            }
        }
        tx.commit().map_err(StoreError::write("commit"))?;
        info!(inserted, "target companies seeded");
        Ok(inserted)
    }

    pub fn add_company(
        &self,
        name: &str,
        source: Option<&str>,
        external_id: Option<&str>,
    ) -> StoreResult<i64> {
        self.conn
            .execute(
                "INSERT INTO companies (name, source, external_id) VALUES (?1, ?2, ?3)",
                params![name, source, external_id],
            )
            .map_err(StoreError::write("add company"))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_companies(&self, aliases: &AliasTable) -> Vec<CompanyRecord> {
        degrade("list companies", load_companies(&self.conn, aliases))
    }

    pub fn companies_with_vacancy_counts(&self) -> Vec<(String, i64)> {
        degrade("count vacancies per company", self.try_companies_with_vacancy_counts())
    }

    fn try_companies_with_vacancy_counts(&self) -> rusqlite::Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.name, COUNT(v.id) AS vacancy_count
             FROM companies c
             LEFT JOIN vacancies v ON v.company_id = c.id
             GROUP BY c.id, c.name
             ORDER BY vacancy_count DESC, c.name",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    // --- Vacancy reads ---

    pub fn load_vacancies(&self, limit: Option<usize>, offset: usize) -> Vec<StoredVacancy> {
        degrade("load vacancies", self.try_load_vacancies(limit, offset))
    }

    fn try_load_vacancies(
        &self,
        limit: Option<usize>,
        offset: usize,
    ) -> rusqlite::Result<Vec<StoredVacancy>> {
        let sql = format!(
            "SELECT {VACANCY_COLUMNS}
             FROM vacancies v
             LEFT JOIN companies c ON v.company_id = c.id
             ORDER BY v.created_at DESC, v.id DESC
             LIMIT ?1 OFFSET ?2"
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit, offset as i64], Self::row_to_vacancy)?;
        rows.collect()
    }

    /// Salary bounds are pushed into SQL; every other predicate, the sort and
    /// the limit go through the in-memory filter.
    pub fn search_vacancies(&self, criteria: &FilterCriteria) -> Vec<StoredVacancy> {
        let stored = degrade("search vacancies", self.try_salary_window(criteria));
        filter::apply_stored(stored, criteria)
    }

    fn try_salary_window(&self, criteria: &FilterCriteria) -> rusqlite::Result<Vec<StoredVacancy>> {
        let mut sql = format!(
            "SELECT {VACANCY_COLUMNS}
             FROM vacancies v
             LEFT JOIN companies c ON v.company_id = c.id"
        );
        let mut values: Vec<Value> = Vec::new();
        if criteria.has_salary_bounds() {
            let lo = criteria.min_salary.unwrap_or(i64::MIN);
            let hi = criteria.max_salary.unwrap_or(i64::MAX);
            sql.push_str(
                " WHERE (v.salary_from BETWEEN ?1 AND ?2) OR (v.salary_to BETWEEN ?1 AND ?2)",
            );
            values.push(Value::Integer(lo));
            values.push(Value::Integer(hi));
        }
        sql.push_str(" ORDER BY v.created_at DESC, v.id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::row_to_vacancy)?;
        rows.collect()
    }

    pub fn get_vacancy(&self, source_id: &str) -> Option<StoredVacancy> {
        let sql = format!(
            "SELECT {VACANCY_COLUMNS}
             FROM vacancies v
             LEFT JOIN companies c ON v.company_id = c.id
             WHERE v.vacancy_id = ?1"
        );
        match self.conn.query_row(&sql, [source_id], Self::row_to_vacancy) {
            Ok(vacancy) => Some(vacancy),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                error!(source_id, error = %e, "failed to load vacancy");
                None
            }
        }
    }

    pub fn count_vacancies(&self) -> usize {
        let count: rusqlite::Result<i64> =
            self.conn
                .query_row("SELECT COUNT(*) FROM vacancies", [], |row| row.get(0));
        degrade("count vacancies", count) as usize
    }

    /// Mean of each vacancy's salary midpoint (or whichever end is known).
    pub fn average_salary(&self) -> Option<f64> {
        let avg: rusqlite::Result<Option<f64>> = self.conn.query_row(
            &format!("SELECT AVG({SALARY_MIDPOINT}) FROM vacancies v"),
            [],
            |row| row.get(0),
        );
        degrade("average salary", avg)
    }

    /// Vacancies whose salary midpoint beats the average, best paid first.
    pub fn vacancies_above_average_salary(&self) -> Vec<StoredVacancy> {
        degrade("vacancies above average salary", self.try_above_average_salary())
    }

    fn try_above_average_salary(&self) -> rusqlite::Result<Vec<StoredVacancy>> {
        let sql = format!(
            "SELECT {VACANCY_COLUMNS}
             FROM vacancies v
             LEFT JOIN companies c ON v.company_id = c.id
             WHERE {SALARY_MIDPOINT} > (SELECT AVG({SALARY_MIDPOINT}) FROM vacancies v)
             ORDER BY {SALARY_MIDPOINT} DESC, v.id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_vacancy)?;
        rows.collect()
    }

    pub fn database_stats(&self) -> DatabaseStats {
        degrade("database stats", self.try_database_stats())
    }

    fn try_database_stats(&self) -> rusqlite::Result<DatabaseStats> {
        // published_at is stored as UTC RFC 3339, so MAX is chronological
        self.conn.query_row(
            "SELECT COUNT(*),
                    COUNT(CASE WHEN salary_from IS NOT NULL OR salary_to IS NOT NULL THEN 1 END),
                    COUNT(DISTINCT NULLIF(TRIM(employer), '')),
                    MAX(published_at)
             FROM vacancies",
            [],
            |row| {
                let latest: Option<String> = row.get(3)?;
                Ok(DatabaseStats {
                    total_vacancies: row.get::<_, i64>(0)? as usize,
                    vacancies_with_salary: row.get::<_, i64>(1)? as usize,
                    distinct_employers: row.get::<_, i64>(2)? as usize,
                    latest_published_at: latest.as_deref().and_then(parse_stored_timestamp),
                })
            },
        )
    }

    pub fn existing_source_ids(&self, source_ids: &[&str]) -> HashSet<String> {
        if source_ids.is_empty() {
            return HashSet::new();
        }
        degrade("check existing vacancies", self.try_existing_source_ids(source_ids))
    }

    fn try_existing_source_ids(&self, source_ids: &[&str]) -> rusqlite::Result<HashSet<String>> {
        let placeholders = vec!["?"; source_ids.len()].join(",");
        let sql = format!("SELECT vacancy_id FROM vacancies WHERE vacancy_id IN ({placeholders})");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(source_ids.iter()), |row| row.get(0))?;
        rows.collect()
    }

    // --- Vacancy deletes ---

    pub fn delete_vacancy(&self, source_id: &str) -> StoreResult<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM vacancies WHERE vacancy_id = ?1", [source_id])
            .map_err(StoreError::write("delete vacancy"))?;
        Ok(removed > 0)
    }

    /// Case-insensitive for any alphabet; SQLite's LOWER only folds ASCII.
    pub fn delete_vacancies_by_keyword(&mut self, keyword: &str) -> StoreResult<usize> {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction().map_err(StoreError::write("begin"))?;
        let doomed: Vec<i64> = {
            let mut stmt = tx
                .prepare("SELECT id, title FROM vacancies")
                .map_err(StoreError::write("scan titles"))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
                .map_err(StoreError::write("scan titles"))?;
            let mut ids = Vec::new();
            for row in rows {
                let (id, title) = row.map_err(StoreError::write("scan titles"))?;
                if title.to_lowercase().contains(&needle) {
                    ids.push(id);
                }
            }
            ids
        };
        {
            let mut stmt = tx
                .prepare("DELETE FROM vacancies WHERE id = ?1")
                .map_err(StoreError::write("delete by keyword"))?;
            for id in &doomed {
                stmt.execute([id])
                    .map_err(StoreError::write("delete by keyword"))?;
            }
        }
        tx.commit().map_err(StoreError::write("commit"))?;
        if !doomed.is_empty() {
            info!(keyword, removed = doomed.len(), "vacancies deleted by keyword");
        }
        Ok(doomed.len())
    }

    fn row_to_vacancy(row: &rusqlite::Row) -> rusqlite::Result<StoredVacancy> {
        let salary_from: Option<i64> = row.get(4)?;
        let salary_to: Option<i64> = row.get(5)?;
        let salary_currency: Option<String> = row.get(6)?;
        let salary = if salary_from.is_some() || salary_to.is_some() || salary_currency.is_some() {
            Some(Salary {
                from: salary_from,
                to: salary_to,
                currency: salary_currency,
            })
        } else {
            None
        };
        let published_at: Option<String> = row.get(17)?;
        let record = VacancyRecord {
            source_id: row.get(1)?,
            title: row.get(2)?,
            url: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            salary,
            description: row.get(7)?,
            requirements: row.get(8)?,
            responsibilities: row.get(9)?,
            experience: row.get(10)?,
            employment: row.get(11)?,
            schedule: row.get(12)?,
            employer: Employer {
                name: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
                external_id: row.get(14)?,
            },
            area: row.get(15)?,
            source: row.get(16)?,
            published_at: published_at.as_deref().and_then(parse_stored_timestamp),
            company_id: row.get(18)?,
        };
        Ok(StoredVacancy {
            id: row.get(0)?,
            record,
            company_name: row.get(19)?,
            created_at: row.get(20)?,
            updated_at: row.get(21)?,
        })
    }
}

fn parse_stored_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Read-side failures are logged and replaced with an empty result.
fn degrade<T: Default>(what: &str, result: rusqlite::Result<T>) -> T {
    result.unwrap_or_else(|e| {
        error!(operation = what, error = %e, "read failed, returning empty result");
        T::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RawCriteria;

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        db
    }

    fn insert(db: &Database, id: &str, title: &str, salary_from: Option<i64>) {
        db.connection()
            .execute(
                "INSERT INTO vacancies (vacancy_id, title, url, salary_from)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, title, format!("https://example.com/{id}"), salary_from],
            )
            .unwrap();
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let db = seeded();
        insert(&db, "1", "Rust Developer", None);
        db.ensure_schema().unwrap();
        assert_eq!(db.count_vacancies(), 1);
    }

    #[test]
    fn seeding_twice_inserts_once() {
        let mut db = seeded();
        let first = db.seed_target_companies().unwrap();
        let second = db.seed_target_companies().unwrap();
        assert_eq!(first, TARGET_COMPANIES.len());
        assert_eq!(second, 0);
        let companies = db.list_companies(&AliasTable::default());
        let yandex = companies.iter().find(|c| c.name == "Яндекс").unwrap();
        assert_eq!(yandex.external_ids.get("hh").map(String::as_str), Some("1740"));
        assert!(yandex.aliases.contains(&"yandex".to_string()));
    }

    #[test]
    fn reads_degrade_to_empty_without_schema() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.load_vacancies(None, 0).is_empty());
        assert_eq!(db.count_vacancies(), 0);
        assert!(db.get_vacancy("1").is_none());
        assert!(db.companies_with_vacancy_counts().is_empty());
        assert!(db.existing_source_ids(&["1"]).is_empty());
    }

    #[test]
    fn load_respects_limit_and_offset() {
        let db = seeded();
        for i in 0..5 {
            insert(&db, &i.to_string(), "Dev", None);
        }
        assert_eq!(db.load_vacancies(Some(2), 0).len(), 2);
        assert_eq!(db.load_vacancies(None, 3).len(), 2);
        assert_eq!(db.load_vacancies(None, 0).len(), 5);
    }

    #[test]
    fn search_pushes_salary_bounds_down() {
        let db = seeded();
        insert(&db, "1", "Python Developer", Some(150_000));
        insert(&db, "2", "Python Developer", Some(50_000));
        insert(&db, "3", "Go Developer", Some(200_000));
        let criteria = FilterCriteria::from_raw(RawCriteria {
            min_salary: Some(serde_json::json!(100000)),
            keywords: Some(vec!["python".into()]),
            ..Default::default()
        });
        let found = db.search_vacancies(&criteria);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].record.source_id, "1");
    }

    #[test]
    fn average_salary_uses_midpoints() {
        let db = seeded();
        db.connection()
            .execute_batch(
                "INSERT INTO vacancies (vacancy_id, title, salary_from, salary_to)
                     VALUES ('a', 't', 100, 200);
                 INSERT INTO vacancies (vacancy_id, title, salary_to) VALUES ('b', 't', 300);
                 INSERT INTO vacancies (vacancy_id, title) VALUES ('c', 't');",
            )
            .unwrap();
        assert_eq!(db.average_salary(), Some(225.0));
    }

    #[test]
    fn above_average_is_ranked_by_midpoint() {
        let db = seeded();
        db.connection()
            .execute_batch(
                "INSERT INTO vacancies (vacancy_id, title, salary_from, salary_to)
                     VALUES ('a', 't', 100, 200);
                 INSERT INTO vacancies (vacancy_id, title, salary_to) VALUES ('b', 't', 300);
                 INSERT INTO vacancies (vacancy_id, title) VALUES ('c', 't');
                 INSERT INTO vacancies (vacancy_id, title, salary_from) VALUES ('d', 't', 50);
                 INSERT INTO vacancies (vacancy_id, title, salary_from) VALUES ('e', 't', 200);",
            )
            .unwrap();
        // average of 150, 300, 50 and 200 is 175
        let above: Vec<String> = db
            .vacancies_above_average_salary()
            .into_iter()
            .map(|v| v.record.source_id)
            .collect();
        assert_eq!(above, vec!["b", "e"]);
    }

    #[test]
    fn above_average_without_salaries_is_empty() {
        let db = seeded();
        insert(&db, "1", "Dev", None);
        assert!(db.vacancies_above_average_salary().is_empty());
        assert!(Database::open_in_memory().unwrap().vacancies_above_average_salary().is_empty());
    }

    #[test]
    fn stats_count_salaries_employers_and_latest_date() {
        let db = seeded();
        db.connection()
            .execute_batch(
                "INSERT INTO vacancies (vacancy_id, title, salary_from, employer, published_at)
                     VALUES ('1', 't', 100, 'Яндекс', '2024-03-01T12:00:00+00:00');
                 INSERT INTO vacancies (vacancy_id, title, employer, published_at)
                     VALUES ('2', 't', 'Яндекс', '2024-05-20T08:15:00+00:00');
                 INSERT INTO vacancies (vacancy_id, title, salary_to, employer)
                     VALUES ('3', 't', 90, '  ');
                 INSERT INTO vacancies (vacancy_id, title, employer) VALUES ('4', 't', 'Авито');",
            )
            .unwrap();
        let stats = db.database_stats();
        assert_eq!(stats.total_vacancies, 4);
        assert_eq!(stats.vacancies_with_salary, 2);
        assert_eq!(stats.distinct_employers, 2);
        assert_eq!(
            stats.latest_published_at,
            chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 5, 20, 8, 15, 0).single()
        );
    }

    #[test]
    fn stats_degrade_to_zero_without_schema() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.database_stats(), DatabaseStats::default());
    }

    #[test]
    fn existing_ids_and_deletes() {
        let mut db = seeded();
        insert(&db, "1", "Разработчик Python", None);
        insert(&db, "2", "Java Developer", None);
        let existing = db.existing_source_ids(&["1", "3"]);
        assert!(existing.contains("1") && !existing.contains("3"));

        assert_eq!(db.delete_vacancies_by_keyword("PYTHON").unwrap(), 1);
        assert!(db.delete_vacancy("2").unwrap());
        assert!(!db.delete_vacancy("2").unwrap());
        assert_eq!(db.count_vacancies(), 0);
    }

    #[test]
    fn keyword_delete_folds_cyrillic_case() {
        let mut db = seeded();
        insert(&db, "1", "Ведущий РАЗРАБОТЧИК", None);
        assert_eq!(db.delete_vacancies_by_keyword("разработчик").unwrap(), 1);
    }

    #[test]
    fn companies_report_counts() {
        let db = seeded();
        let id = db.add_company("Яндекс", Some("hh"), Some("1740")).unwrap();
        db.add_company("Авито", None, None).unwrap();
        db.connection()
            .execute(
                "INSERT INTO vacancies (vacancy_id, title, company_id) VALUES ('1', 'Dev', ?1)",
                [id],
            )
            .unwrap();
        let counts = db.companies_with_vacancy_counts();
        assert_eq!(counts[0], ("Яндекс".to_string(), 1));
        assert_eq!(counts[1], ("Авито".to_string(), 0));
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vacancies.db");
        let db = Database::open_at(&path).unwrap();
        db.ensure_schema().unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), path.as_path());
    }
}
