//! Batch ingestion of job vacancies into SQLite.

pub mod companies;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod models;
pub mod staging;
pub mod upsert;

pub use config::Config;
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use ingest::{IngestOptions, Pipeline};
pub use models::{UpsertReport, VacancyRecord};
pub use upsert::BatchUpserter;
