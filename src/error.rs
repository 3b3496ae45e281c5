use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot open database at {path}")]
    Connection {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("schema bootstrap failed")]
    Schema(#[source] rusqlite::Error),

    #[error("cannot create data directory {path}")]
    DataDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load company mapping")]
    CompanyMapping(#[source] rusqlite::Error),

    #[error("batch write failed during {stage}")]
    Write {
        stage: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("invalid record {source_id:?}: missing {field}")]
    InvalidRecord {
        source_id: String,
        field: &'static str,
    },
}

impl StoreError {
    pub(crate) fn write(stage: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Write { stage, source }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
