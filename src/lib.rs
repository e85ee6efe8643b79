pub mod chunker;
pub mod config;
pub mod error;
pub mod integrity;
pub mod orchestrator;
pub mod remote;
pub mod source;
pub mod state;
pub mod types;

pub use chunker::SqlChunker;
pub use config::{ChecksumAlgorithm, Limits, LoggingConfig, Settings, SyncOptions, Tier};
pub use error::{Result, SyncError};
pub use integrity::{ChecksumAlg, IntegrityChecker, Mismatch, MismatchKind, VerificationResult};
pub use orchestrator::{CancellationToken, Orchestrator};
pub use remote::RemoteClient;
pub use source::{RowBatchIter, SqliteSource};
pub use state::StateManager;
pub use types::{
    CellValue, ColumnDescriptor, FailedRow, InsertChunk, OverallStatus, RowBatch, SyncOperation,
    SyncStats, SyncState, TableDescriptor, TableProgress, TableStatus,
};
