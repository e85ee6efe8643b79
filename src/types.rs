use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A dynamically-typed cell value, used only at the chunker/integrity boundary.
/// Everywhere else the pipeline keeps the driver's native row representation.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
}

impl From<rusqlite::types::Value> for CellValue {
    fn from(value: rusqlite::types::Value) -> Self {
        use rusqlite::types::Value as V;
        match value {
            V::Null => CellValue::Null,
            V::Integer(i) => CellValue::Int(i),
            V::Real(f) => CellValue::Float(f),
            V::Text(s) => CellValue::Text(s),
            V::Blob(b) => CellValue::Blob(b),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub row_count: u64,
    pub index_names: Vec<String>,
    pub create_statement: String,
}

/// A page of rows read from the source before chunking.
#[derive(Debug, Clone)]
pub struct RowBatch {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    pub start_offset: u64,
    pub fingerprint: String,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.rows.len() as u64
    }
}

/// A serialized multi-row INSERT statement bounded by the remote's byte ceiling.
#[derive(Debug, Clone)]
pub struct InsertChunk {
    pub table: String,
    pub sql: String,
    pub row_count: usize,
    pub byte_size: usize,
    pub start_offset: u64,
    pub end_offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableProgress {
    pub name: String,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub failed_rows: u64,
    pub last_offset: u64,
    pub checksum: Option<String>,
    pub status: TableStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TableProgress {
    pub fn new(name: impl Into<String>, total_rows: u64) -> Self {
        TableProgress {
            name: name.into(),
            total_rows,
            processed_rows: 0,
            failed_rows: 0,
            last_offset: 0,
            checksum: None,
            status: TableStatus::Pending,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    InProgress,
    Completed,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRow {
    pub table: String,
    pub offset: u64,
    pub row_data: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub operation: SyncOperation,
    pub source: String,
    pub destination: String,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub status: OverallStatus,
    pub tables: BTreeMap<String, TableProgress>,
    pub failed_rows: Vec<FailedRow>,
    pub processed_rows: u64,
    pub failed_row_count: u64,
    pub settings_fingerprint: String,
}

impl SyncState {
    pub fn new(
        operation: SyncOperation,
        source: impl Into<String>,
        destination: impl Into<String>,
        settings_fingerprint: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        SyncState {
            operation,
            source: source.into(),
            destination: destination.into(),
            started_at: now,
            last_updated_at: now,
            status: OverallStatus::InProgress,
            tables: BTreeMap::new(),
            failed_rows: Vec::new(),
            processed_rows: 0,
            failed_row_count: 0,
            settings_fingerprint: settings_fingerprint.into(),
        }
    }
}

/// Snapshot of a running (or finished) sync, handed to the progress callback
/// between batches and returned to the caller when the run ends.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub operation: Option<SyncOperation>,
    pub tables_total: u64,
    pub tables_processed: u64,
    pub tables_failed: u64,
    pub rows_total: u64,
    pub rows_processed: u64,
    pub rows_failed: u64,
    pub bytes_transferred: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl SyncStats {
    pub fn duration_seconds(&self) -> f64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
            (Some(start), None) => (Utc::now() - start).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        }
    }

    pub fn rows_per_second(&self) -> f64 {
        let secs = self.duration_seconds();
        if secs <= 0.0 {
            0.0
        } else {
            self.rows_processed as f64 / secs
        }
    }

    pub fn percent_complete(&self) -> f64 {
        if self.rows_total == 0 {
            100.0
        } else {
            (self.rows_processed + self.rows_failed) as f64 / self.rows_total as f64 * 100.0
        }
    }
}
