use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

use crate::error::Result;
use crate::types::{
    FailedRow, OverallStatus, SyncOperation, SyncState, TableProgress, TableStatus,
};

/// Persists [`SyncState`] as pretty-printed JSON, atomically (write to a
/// sibling temporary file, then rename) so a crash mid-write cannot leave
/// a truncated state file behind. A second plain JSON file holds the flat
/// failed-row list for operator inspection.
pub struct StateManager {
    state_path: PathBuf,
    failed_rows_path: PathBuf,
    state: Option<SyncState>,
}

#[derive(Default, Clone, Debug)]
pub struct TableProgressUpdate {
    pub processed: Option<u64>,
    pub failed: Option<u64>,
    pub last_offset: Option<u64>,
    pub status: Option<TableStatus>,
    pub checksum: Option<String>,
}

impl StateManager {
    pub fn new(state_path: impl Into<PathBuf>, failed_rows_path: impl Into<PathBuf>) -> Self {
        StateManager {
            state_path: state_path.into(),
            failed_rows_path: failed_rows_path.into(),
            state: None,
        }
    }

    pub fn state(&self) -> Option<&SyncState> {
        self.state.as_ref()
    }

    /// Loads the state file if it exists and parses; a corrupted file is
    /// logged and treated as absent rather than propagated as an error.
    pub fn load(&mut self) -> Result<Option<&SyncState>> {
        if !self.state_path.exists() {
            self.state = None;
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.state_path)?;
        match serde_json::from_str::<SyncState>(&contents) {
            Ok(state) => {
                self.state = Some(state);
                Ok(self.state.as_ref())
            }
            Err(err) => {
                warn!(error = %err, path = %self.state_path.display(), "state file is corrupt, starting fresh");
                self.state = None;
                Ok(None)
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(state) = &self.state {
            write_atomic(&self.state_path, &serde_json::to_vec_pretty(state)?)?;
            write_atomic(
                &self.failed_rows_path,
                &serde_json::to_vec_pretty(&state.failed_rows)?,
            )?;
        }
        Ok(())
    }

    /// Returns a matching in-progress state for resume, or creates a fresh one.
    pub fn get_or_create(
        &mut self,
        operation: SyncOperation,
        source: &str,
        destination: &str,
        settings_fingerprint: &str,
    ) -> Result<&mut SyncState> {
        self.load()?;
        let matches = matches!(&self.state, Some(s)
            if s.operation == operation
            && s.source == source
            && s.destination == destination
            && s.status == OverallStatus::InProgress
            && s.settings_fingerprint == settings_fingerprint);

        if !matches {
            self.state = Some(SyncState::new(
                operation,
                source,
                destination,
                settings_fingerprint,
                Utc::now(),
            ));
        }
        Ok(self.state.as_mut().expect("state just set"))
    }

    pub fn init_table(&mut self, name: &str, total_rows: u64) {
        if let Some(state) = &mut self.state {
            state
                .tables
                .entry(name.to_string())
                .or_insert_with(|| TableProgress::new(name, total_rows));
        }
    }

    pub fn get_table_progress(&self, name: &str) -> Option<&TableProgress> {
        self.state.as_ref().and_then(|s| s.tables.get(name))
    }

    pub fn update_table_progress(&mut self, name: &str, update: TableProgressUpdate) {
        let now = Utc::now();
        if let Some(state) = &mut self.state {
            if let Some(progress) = state.tables.get_mut(name) {
                if let Some(p) = update.processed {
                    progress.processed_rows = p;
                }
                if let Some(f) = update.failed {
                    progress.failed_rows = f;
                }
                if let Some(o) = update.last_offset {
                    progress.last_offset = o;
                }
                if let Some(c) = update.checksum {
                    progress.checksum = Some(c);
                }
                if let Some(status) = update.status {
                    if status == TableStatus::InProgress && progress.started_at.is_none() {
                        progress.started_at = Some(now);
                    }
                    if matches!(status, TableStatus::Completed | TableStatus::Failed) {
                        progress.completed_at = Some(now);
                    }
                    progress.status = status;
                }
            }
            state.last_updated_at = now;
            state.processed_rows = state.tables.values().map(|t| t.processed_rows).sum();
            state.failed_row_count = state.tables.values().map(|t| t.failed_rows).sum();
        }
    }

    /// Deduplicates by `(table, offset)`: a repeat bumps `retry_count`
    /// and overwrites the error text and timestamp.
    pub fn record_failed_row(&mut self, table: &str, offset: u64, row_data: String, error: String) {
        if let Some(state) = &mut self.state {
            let now = Utc::now();
            if let Some(existing) = state
                .failed_rows
                .iter_mut()
                .find(|r| r.table == table && r.offset == offset)
            {
                existing.error = error;
                existing.timestamp = now;
                existing.retry_count += 1;
            } else {
                state.failed_rows.push(FailedRow {
                    table: table.to_string(),
                    offset,
                    row_data,
                    error,
                    timestamp: now,
                    retry_count: 0,
                });
            }
        }
    }

    pub fn get_resume_offset(&self, table: &str) -> u64 {
        match self.get_table_progress(table).map(|p| p.status) {
            Some(TableStatus::InProgress) | Some(TableStatus::Failed) => self
                .get_table_progress(table)
                .map(|p| p.last_offset)
                .unwrap_or(0),
            _ => 0,
        }
    }

    pub fn should_process(&self, table: &str) -> bool {
        !matches!(
            self.get_table_progress(table).map(|p| p.status),
            Some(TableStatus::Completed)
        )
    }

    pub fn mark_sync_complete(&mut self, status: OverallStatus) {
        if let Some(state) = &mut self.state {
            state.status = status;
            state.last_updated_at = Utc::now();
        }
    }

    pub fn clear_state(&mut self) -> Result<()> {
        self.state = None;
        if self.state_path.exists() {
            fs::remove_file(&self.state_path)?;
        }
        if self.failed_rows_path.exists() {
            fs::remove_file(&self.failed_rows_path)?;
        }
        Ok(())
    }

    pub fn get_summary(&self) -> Option<(u64, u64, OverallStatus)> {
        self.state
            .as_ref()
            .map(|s| (s.processed_rows, s.failed_row_count, s.status))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn get_or_create_resumes_matching_in_progress_state() {
        let dir = tempdir().unwrap();
        let mut mgr = StateManager::new(dir.path().join("state.json"), dir.path().join("failed.json"));
        {
            let state = mgr
                .get_or_create(SyncOperation::Push, "src", "dst", "fp1")
                .unwrap();
            state.processed_rows = 42;
        }
        mgr.save().unwrap();

        let mut mgr2 = StateManager::new(dir.path().join("state.json"), dir.path().join("failed.json"));
        let state = mgr2
            .get_or_create(SyncOperation::Push, "src", "dst", "fp1")
            .unwrap();
        assert_eq!(state.processed_rows, 42);
    }

    #[test]
    fn get_or_create_starts_fresh_when_fingerprint_differs() {
        let dir = tempdir().unwrap();
        let mut mgr = StateManager::new(dir.path().join("state.json"), dir.path().join("failed.json"));
        mgr.get_or_create(SyncOperation::Push, "src", "dst", "fp1")
            .unwrap()
            .processed_rows = 42;
        mgr.save().unwrap();

        let mut mgr2 = StateManager::new(dir.path().join("state.json"), dir.path().join("failed.json"));
        let state = mgr2
            .get_or_create(SyncOperation::Push, "src", "dst", "fp2")
            .unwrap();
        assert_eq!(state.processed_rows, 0);
    }

    #[test]
    fn record_failed_row_dedupes_by_table_and_offset() {
        let dir = tempdir().unwrap();
        let mut mgr = StateManager::new(dir.path().join("state.json"), dir.path().join("failed.json"));
        mgr.get_or_create(SyncOperation::Push, "src", "dst", "fp")
            .unwrap();
        mgr.record_failed_row("users", 10, "row".to_string(), "first error".to_string());
        mgr.record_failed_row("users", 10, "row".to_string(), "second error".to_string());
        let state = mgr.state().unwrap();
        assert_eq!(state.failed_rows.len(), 1);
        assert_eq!(state.failed_rows[0].retry_count, 1);
        assert_eq!(state.failed_rows[0].error, "second error");
    }

    #[test]
    fn corrupted_state_file_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        fs::write(&state_path, b"not json").unwrap();
        let mut mgr = StateManager::new(state_path, dir.path().join("failed.json"));
        let loaded = mgr.load().unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn should_process_is_false_only_when_completed() {
        let dir = tempdir().unwrap();
        let mut mgr = StateManager::new(dir.path().join("state.json"), dir.path().join("failed.json"));
        mgr.get_or_create(SyncOperation::Push, "src", "dst", "fp")
            .unwrap();
        mgr.init_table("users", 10);
        assert!(mgr.should_process("users"));
        mgr.update_table_progress(
            "users",
            TableProgressUpdate {
                status: Some(TableStatus::Completed),
                ..Default::default()
            },
        );
        assert!(!mgr.should_process("users"));
    }
}
