use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::chunker::SqlChunker;
use crate::config::Settings;
use crate::error::{Result, SyncError};
use crate::integrity::{find_mismatches, ChecksumAlg, MismatchKind};
use crate::remote::RemoteClient;
use crate::source::SqliteSource;
use crate::state::{StateManager, TableProgressUpdate};
use crate::types::{CellValue, OverallStatus, SyncOperation, SyncStats, TableStatus};

/// Cooperative cancellation handle, checked between batches and between
/// chunks within a batch. Cloning shares the same underlying flag.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type ProgressCallback<'a> = dyn Fn(&SyncStats) + 'a;

/// Planner and driver: selects tables, enforces schema, iterates
/// batches -> chunks -> remote, updates state, aggregates statistics,
/// runs verification.
pub struct Orchestrator {
    settings: Settings,
}

impl Orchestrator {
    pub fn new(settings: Settings) -> Self {
        Orchestrator { settings }
    }

    #[instrument(skip(self, source, remote, state, progress, cancel))]
    pub async fn push(
        &self,
        source: &SqliteSource,
        remote: &RemoteClient,
        state: &mut StateManager,
        progress: Option<&ProgressCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<SyncStats> {
        let fingerprint = self.settings.fingerprint();
        let source_label = self
            .settings
            .database
            .source_path
            .clone()
            .unwrap_or_else(|| "source".to_string());
        let destination_label = self.settings.database_id.clone();

        state.get_or_create(
            SyncOperation::Push,
            &source_label,
            &destination_label,
            &fingerprint,
        )?;

        let all_tables = source.list_tables()?;
        let tables: Vec<_> = all_tables
            .into_iter()
            .filter(|t| self.should_include(&t.name))
            .collect();

        let mut stats = SyncStats {
            operation: Some(SyncOperation::Push),
            tables_total: tables.len() as u64,
            rows_total: tables.iter().map(|t| t.row_count).sum(),
            start_time: Some(Utc::now()),
            ..Default::default()
        };

        let algorithm: ChecksumAlg = self
            .settings
            .sync
            .checksum_algorithm
            .unwrap_or(crate::config::ChecksumAlgorithm::Md5)
            .into();
        let chunker = SqlChunker::new(
            self.settings.limits.max_sql_bytes,
            self.settings.limits.batch_safety_margin,
            self.settings.sync.overwrite,
        );
        let batch_size = self
            .settings
            .sync
            .batch_size_override
            .unwrap_or(self.settings.limits.max_rows_per_batch);

        for table in &tables {
            if cancel.is_cancelled() {
                break;
            }
            state.init_table(&table.name, table.row_count);
            if !state.should_process(&table.name) {
                if let Some(completed) = state.get_table_progress(&table.name) {
                    stats.tables_processed += 1;
                    stats.rows_processed += completed.processed_rows;
                    stats.rows_failed += completed.failed_rows;
                }
                continue;
            }

            if self.settings.sync.drop_before_sync {
                remote.execute(&format!("DROP TABLE IF EXISTS \"{}\"", table.name)).await.ok();
            }

            state.update_table_progress(
                &table.name,
                TableProgressUpdate {
                    status: Some(TableStatus::InProgress),
                    ..Default::default()
                },
            );

            if self.settings.sync.sync_schema {
                let create_if_not_exists = rewrite_create_table(&table.create_statement);
                if !self.settings.sync.dry_run {
                    if let Err(err) = remote.execute(&create_if_not_exists).await {
                        warn!(table = %table.name, error = %err, "schema sync failed");
                    }
                }
            }

            let resume_offset = if self.settings.sync.resume {
                state.get_resume_offset(&table.name)
            } else {
                0
            };
            let start_offset = self.settings.sync.offset.unwrap_or(resume_offset);
            let batches = source.iter_rows(
                &table.name,
                &[],
                batch_size,
                start_offset,
                self.settings.sync.limit,
                None,
                algorithm,
            )?;

            let mut table_processed = 0u64;
            let mut table_failed = 0u64;
            let mut last_offset = start_offset;

            'batches: for batch in batches {
                if cancel.is_cancelled() {
                    break 'batches;
                }
                let batch = batch?;
                let (chunks, oversize_failures) = chunker.chunk_rows(&batch);
                for failure in oversize_failures {
                    if let SyncError::OversizeRow { offset, .. } = &failure {
                        state.record_failed_row(
                            &table.name,
                            *offset,
                            String::new(),
                            failure.to_string(),
                        );
                        table_failed += 1;
                    }
                }

                if cancel.is_cancelled() {
                    break 'batches;
                }
                if self.settings.sync.dry_run {
                    table_processed += chunks.iter().map(|c| c.row_count as u64).sum::<u64>();
                } else {
                    let outcomes = dispatch_chunks(
                        remote,
                        &chunks,
                        self.settings.limits.concurrent_batches as usize,
                    )
                    .await;
                    // Offsets commit in the chunks' own order regardless of
                    // which HTTP call actually completed first.
                    for (chunk, outcome) in chunks.iter().zip(outcomes) {
                        match outcome {
                            Ok(result) => {
                                table_processed += chunk.row_count as u64;
                                stats.bytes_transferred += chunk.byte_size as u64;
                                let _ = result.rows_written;
                            }
                            Err(err) => {
                                table_failed += chunk.row_count as u64;
                                state.record_failed_row(
                                    &table.name,
                                    chunk.start_offset,
                                    String::new(),
                                    err.to_string(),
                                );
                                stats.errors.push(format!(
                                    "{}@{}: {err}",
                                    table.name, chunk.start_offset
                                ));
                            }
                        }
                    }
                }

                last_offset = batch.end_offset();
                state.update_table_progress(
                    &table.name,
                    TableProgressUpdate {
                        processed: Some(table_processed),
                        failed: Some(table_failed),
                        last_offset: Some(last_offset),
                        ..Default::default()
                    },
                );
                stats.rows_processed = state.get_summary().map(|(p, _, _)| p).unwrap_or(0);
                stats.rows_failed = state.get_summary().map(|(_, f, _)| f).unwrap_or(0);
                if let Some(cb) = progress {
                    cb(&stats);
                }
                state.save()?;
            }

            let final_status = if table_failed == 0 {
                TableStatus::Completed
            } else {
                TableStatus::Failed
            };
            state.update_table_progress(
                &table.name,
                TableProgressUpdate {
                    status: Some(final_status),
                    ..Default::default()
                },
            );
            if final_status == TableStatus::Completed {
                stats.tables_processed += 1;
            } else {
                stats.tables_failed += 1;
            }
            state.save()?;
        }

        if cancel.is_cancelled() {
            state.mark_sync_complete(OverallStatus::Interrupted);
            state.save()?;
            stats.end_time = Some(Utc::now());
            return Ok(stats);
        }

        if self.settings.sync.verify_after_sync && !self.settings.sync.dry_run {
            for table in &tables {
                match remote.get_table_count(&table.name).await {
                    Ok(remote_count) => {
                        if remote_count != table.row_count {
                            stats.errors.push(format!(
                                "{}: source has {} rows, remote has {}",
                                table.name, table.row_count, remote_count
                            ));
                        }
                    }
                    Err(err) => {
                        stats.errors.push(format!("{}: verification failed: {err}", table.name));
                    }
                }
            }
        }

        let overall = if stats.rows_failed == 0 && stats.errors.is_empty() {
            OverallStatus::Completed
        } else {
            OverallStatus::Failed
        };
        state.mark_sync_complete(overall);
        state.save()?;
        stats.end_time = Some(Utc::now());
        info!(
            tables_processed = stats.tables_processed,
            rows_processed = stats.rows_processed,
            rows_failed = stats.rows_failed,
            "push complete"
        );
        Ok(stats)
    }

    /// Pull is symmetric to push but simpler: enumerate tables via the
    /// remote, page through each with `LIMIT/OFFSET` (resolving the Open
    /// Question left unaddressed by the original's single-page pull), and
    /// write into the local source's write API with the same overwrite
    /// policy as push.
    #[instrument(skip(self, source, remote, progress, cancel))]
    pub async fn pull(
        &self,
        source: &SqliteSource,
        remote: &RemoteClient,
        progress: Option<&ProgressCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<SyncStats> {
        let mut stats = SyncStats {
            operation: Some(SyncOperation::Pull),
            start_time: Some(Utc::now()),
            ..Default::default()
        };

        let remote_tables = remote.get_tables().await?;
        let tables: Vec<_> = remote_tables
            .into_iter()
            .filter(|name| self.should_include(name))
            .collect();
        stats.tables_total = tables.len() as u64;

        let page_size = self.settings.limits.max_rows_per_batch;

        for table in &tables {
            if cancel.is_cancelled() {
                break;
            }
            let total = remote.get_table_count(table).await.unwrap_or(0);
            stats.rows_total += total;

            let mut offset = 0u64;
            let mut table_processed = 0u64;
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let sql = format!(
                    "SELECT * FROM \"{}\" LIMIT {page_size} OFFSET {offset}",
                    table.replace('"', "\"\"")
                );
                let result = remote.execute(&sql).await?;
                if result.rows.is_empty() {
                    break;
                }
                let columns: Vec<String> = result
                    .rows
                    .first()
                    .and_then(|r| r.as_object())
                    .map(|obj| obj.keys().cloned().collect())
                    .unwrap_or_default();
                let rows: Vec<Vec<CellValue>> = result
                    .rows
                    .iter()
                    .map(|row| {
                        columns
                            .iter()
                            .map(|c| json_to_cell(row.get(c)))
                            .collect()
                    })
                    .collect();
                let n = rows.len() as u64;
                source.insert_rows(table, &columns, &rows, self.settings.sync.overwrite)?;
                table_processed += n;
                offset += n;
                stats.rows_processed += n;
                if let Some(cb) = progress {
                    cb(&stats);
                }
                if n < page_size {
                    break;
                }
            }
            let _ = table_processed;
            stats.tables_processed += 1;
        }

        stats.end_time = Some(Utc::now());
        Ok(stats)
    }

    fn should_include(&self, table: &str) -> bool {
        if self.settings.sync.exclude_tables.iter().any(|t| t == table) {
            return false;
        }
        if self.settings.sync.tables.is_empty() {
            return true;
        }
        self.settings.sync.tables.iter().any(|t| t == table)
    }
}

/// Dispatches `chunks` against `remote` with at most `concurrency`
/// in-flight HTTP calls, returning per-chunk outcomes in the chunks'
/// original order even though completions may arrive out of order — the
/// caller commits `last_offset` by walking the returned vector in order,
/// which is what actually enforces the in-order commit rule.
async fn dispatch_chunks(
    remote: &RemoteClient,
    chunks: &[crate::types::InsertChunk],
    concurrency: usize,
) -> Vec<Result<crate::remote::QueryResult>> {
    let concurrency = concurrency.max(1);
    if concurrency == 1 || chunks.len() <= 1 {
        let mut outcomes = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            outcomes.push(remote.execute(&chunk.sql).await);
        }
        return outcomes;
    }

    let mut outcomes: Vec<Option<Result<crate::remote::QueryResult>>> =
        (0..chunks.len()).map(|_| None).collect();
    let mut join_set = tokio::task::JoinSet::new();
    let mut next_to_spawn = 0usize;
    let mut in_flight = 0usize;

    while next_to_spawn < chunks.len() || in_flight > 0 {
        while in_flight < concurrency && next_to_spawn < chunks.len() {
            let index = next_to_spawn;
            let sql = chunks[index].sql.clone();
            let remote = remote.clone();
            join_set.spawn(async move { (index, remote.execute(&sql).await) });
            next_to_spawn += 1;
            in_flight += 1;
        }
        if let Some(joined) = join_set.join_next().await {
            in_flight -= 1;
            if let Ok((index, result)) = joined {
                outcomes[index] = Some(result);
            }
        }
    }

    outcomes
        .into_iter()
        .map(|o| o.unwrap_or_else(|| Err(SyncError::State("chunk dispatch task was lost"))))
        .collect()
}

/// Rewrites `CREATE TABLE "name" (...)` / `CREATE TABLE name (...)` to add
/// `IF NOT EXISTS`, handling both quoted and unquoted name forms.
fn rewrite_create_table(create_statement: &str) -> String {
    let trimmed = create_statement.trim_start();
    let upper_prefix: String = trimmed.chars().take(12).collect::<String>().to_uppercase();
    if upper_prefix.starts_with("CREATE TABLE") {
        let rest = &trimmed["CREATE TABLE".len()..];
        format!("CREATE TABLE IF NOT EXISTS{rest}")
    } else {
        create_statement.to_string()
    }
}

fn json_to_cell(value: Option<&serde_json::Value>) -> CellValue {
    match value {
        None | Some(serde_json::Value::Null) => CellValue::Null,
        Some(serde_json::Value::Bool(b)) => CellValue::Bool(*b),
        Some(serde_json::Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                CellValue::Int(i)
            } else {
                CellValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Some(serde_json::Value::String(s)) => CellValue::Text(s.clone()),
        Some(other) => CellValue::Text(other.to_string()),
    }
}

/// Compares source and remote row counts for a simple post-sync check,
/// building on the integrity checker's mismatch enumeration when a key
/// column and both row sets are available.
pub fn verify_rows(
    source_rows: &[Vec<CellValue>],
    dest_rows: &[Vec<CellValue>],
    key_column: usize,
    algorithm: ChecksumAlg,
) -> Vec<(String, MismatchKind)> {
    find_mismatches(source_rows, dest_rows, key_column, algorithm)
        .into_iter()
        .map(|m| (m.key, m.kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_create_table_handles_quoted_name() {
        let rewritten = rewrite_create_table("CREATE TABLE \"users\" (id INTEGER PRIMARY KEY)");
        assert_eq!(
            rewritten,
            "CREATE TABLE IF NOT EXISTS \"users\" (id INTEGER PRIMARY KEY)"
        );
    }

    #[test]
    fn rewrite_create_table_handles_unquoted_name() {
        let rewritten = rewrite_create_table("CREATE TABLE users (id INTEGER PRIMARY KEY)");
        assert_eq!(
            rewritten,
            "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY)"
        );
    }

    #[test]
    fn cancellation_token_reflects_cancel_call() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn json_to_cell_maps_integers_and_strings() {
        assert!(matches!(
            json_to_cell(Some(&serde_json::json!(5))),
            CellValue::Int(5)
        ));
        assert!(matches!(
            json_to_cell(Some(&serde_json::json!("hi"))),
            CellValue::Text(ref s) if s == "hi"
        ));
        assert!(matches!(json_to_cell(None), CellValue::Null));
    }
}
