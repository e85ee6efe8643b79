use thiserror::Error;

/// Unified failure type for every component in the sync pipeline.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("row at offset {offset} in table {table} is {size} bytes, exceeding the size ceiling")]
    OversizeRow {
        table: String,
        offset: u64,
        size: usize,
    },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("remote error ({code}): {message}")]
    Remote { code: String, message: String },

    #[error("remote transport failure after {attempts} attempts: {message}")]
    Transport { attempts: u32, message: String },

    #[error("bulk import timed out after {elapsed_secs}s")]
    ImportTimeout { elapsed_secs: u64 },

    #[error("bulk import failed: {0}")]
    ImportFailed(String),

    #[error("state store is corrupted: {0}")]
    StateCorrupt(String),

    #[error("source is read-only: {0}")]
    ReadOnly(&'static str),

    #[error("{0}")]
    State(&'static str),
}

pub type Result<T> = std::result::Result<T, SyncError>;
