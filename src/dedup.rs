//! Near-duplicate collapsing by normalized (title, employer) signature.
//!
//! Ranking happens in SQL: signatures are staged in a temp table with their
//! input position and `ROW_NUMBER()` picks the first row of each partition.

use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::models::VacancyRecord;
use crate::staging::StagingArena;

const DEDUP_TABLE: &str = "dedup_staging";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub title: String,
    pub employer: String,
}

impl Signature {
    pub fn of(record: &VacancyRecord) -> Self {
        Self {
            title: normalize_text(&record.title),
            employer: normalize_text(&record.employer.name),
        }
    }
}

/// Lowercase, letters and digits of any script, single spaces.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Returns, in ascending order, the input positions that are the first
/// occurrence of their signature.
pub trait SignatureRanker {
    fn first_occurrences(&mut self, signatures: &[Signature]) -> StoreResult<Vec<usize>>;
}

impl SignatureRanker for Connection {
    fn first_occurrences(&mut self, signatures: &[Signature]) -> StoreResult<Vec<usize>> {
        let tx = self.transaction().map_err(StoreError::write("begin"))?;
        let arena = StagingArena::create(
            &tx,
            DEDUP_TABLE,
            "seq INTEGER PRIMARY KEY, title_sig TEXT NOT NULL, employer_sig TEXT NOT NULL",
        )
        .map_err(StoreError::write("stage signatures"))?;

        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT INTO temp.{DEDUP_TABLE} (seq, title_sig, employer_sig)
                     VALUES (?1, ?2, ?3)"
                ))
                .map_err(StoreError::write("stage signatures"))?;
            for (seq, sig) in signatures.iter().enumerate() {
                stmt.execute(params![seq as i64, sig.title, sig.employer])
                    .map_err(StoreError::write("stage signatures"))?;
            }
        }

        let survivors = {
            let mut stmt = tx.prepare(&format!(
                "WITH ranked AS (
                     SELECT seq,
                            ROW_NUMBER() OVER (
                                PARTITION BY title_sig, employer_sig
                                ORDER BY seq
                            ) AS rn
                     FROM temp.{DEDUP_TABLE}
                 )
                 SELECT seq FROM ranked WHERE rn = 1 ORDER BY seq"
            ))?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            rows.map(|r| r.map(|seq| seq as usize))
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        arena.discard().map_err(StoreError::write("discard staging"))?;
        tx.commit().map_err(StoreError::write("commit"))?;
        Ok(survivors)
    }
}

impl SignatureRanker for Database {
    fn first_occurrences(&mut self, signatures: &[Signature]) -> StoreResult<Vec<usize>> {
        self.connection_mut().first_occurrences(signatures)
    }
}

/// Keeps the first record of every signature, preserving input order.
///
/// Fails open: if ranking errors, the input comes back untouched.
pub fn deduplicate<R>(ranker: &mut R, records: Vec<VacancyRecord>) -> Vec<VacancyRecord>
where
    R: SignatureRanker + ?Sized,
{
    if records.is_empty() {
        return records;
    }
    let signatures: Vec<Signature> = records.iter().map(Signature::of).collect();
    let keep = match ranker.first_occurrences(&signatures) {
        Ok(keep) => keep,
        Err(e) => {
            warn!(error = %e, count = records.len(), "deduplication failed, keeping all records");
            return records;
        }
    };

    let before = records.len();
    let mut slots: Vec<Option<VacancyRecord>> = records.into_iter().map(Some).collect();
    let unique: Vec<VacancyRecord> = keep
        .into_iter()
        .filter_map(|idx| slots.get_mut(idx).and_then(Option::take))
        .collect();
    info!(before, after = unique.len(), removed = before - unique.len(), "deduplicated batch");
    unique
}
