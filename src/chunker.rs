use crate::error::{Result, SyncError};
use crate::types::{CellValue, InsertChunk, RowBatch};

/// Packs rows into `INSERT OR IGNORE`/`INSERT OR REPLACE` statements that
/// each fit within an effective size ceiling `max_sql_bytes * safety_margin`.
pub struct SqlChunker {
    max_bytes: usize,
    overwrite: bool,
}

impl SqlChunker {
    pub fn new(max_sql_bytes: usize, safety_margin: f64, overwrite: bool) -> Self {
        SqlChunker {
            max_bytes: (max_sql_bytes as f64 * safety_margin) as usize,
            overwrite,
        }
    }

    fn verb(&self) -> &'static str {
        if self.overwrite {
            "INSERT OR REPLACE"
        } else {
            "INSERT OR IGNORE"
        }
    }

    fn base_overhead(&self, table: &str, columns: &[String]) -> usize {
        let column_list = columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} INTO \"{}\" ({}) VALUES\n;", self.verb(), table, column_list).len()
    }

    fn format_row(row: &[CellValue]) -> String {
        let values = row.iter().map(escape_value).collect::<Vec<_>>().join(", ");
        format!("({values})")
    }

    /// Splits `batch` into chunks, each at or below the effective byte
    /// ceiling. A row whose own serialized size exceeds the ceiling is
    /// surfaced as [`SyncError::OversizeRow`] without halting the rest of
    /// the batch; the caller decides how to record the failure and
    /// continues with the remaining rows.
    pub fn chunk_rows(&self, batch: &RowBatch) -> (Vec<InsertChunk>, Vec<SyncError>) {
        let mut chunks = Vec::new();
        let mut failures = Vec::new();

        let base = self.base_overhead(&batch.table, &batch.columns);
        let mut current_rows: Vec<String> = Vec::new();
        let mut current_size = base;
        let mut chunk_start = batch.start_offset;

        let flush = |rows: &mut Vec<String>, start: u64, end: u64, size: usize| -> InsertChunk {
            let column_list = batch
                .columns
                .iter()
                .map(|c| format!("\"{c}\""))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "{} INTO \"{}\" ({}) VALUES\n{};",
                self.verb(),
                batch.table,
                column_list,
                rows.join(",\n")
            );
            InsertChunk {
                table: batch.table.clone(),
                row_count: rows.len(),
                byte_size: size,
                sql,
                start_offset: start,
                end_offset: end,
            }
        };

        for (i, row) in batch.rows.iter().enumerate() {
            let offset = batch.start_offset + i as u64;
            let serialized = Self::format_row(row);
            let row_size = serialized.len();
            let separator = if current_rows.is_empty() { 0 } else { 2 };
            let row_cost = row_size + separator;

            if base + row_size > self.max_bytes {
                failures.push(SyncError::OversizeRow {
                    table: batch.table.clone(),
                    offset,
                    size: base + row_size,
                });
                continue;
            }

            if !current_rows.is_empty() && current_size + row_cost > self.max_bytes {
                chunks.push(flush(&mut current_rows, chunk_start, offset, current_size));
                current_rows.clear();
                current_size = base;
                chunk_start = offset;
            }

            if current_rows.is_empty() {
                chunk_start = offset;
            }
            current_size += row_size + if current_rows.is_empty() { 0 } else { 2 };
            current_rows.push(serialized);
        }

        if !current_rows.is_empty() {
            let end = chunk_start + current_rows.len() as u64;
            chunks.push(flush(&mut current_rows, chunk_start, end, current_size));
        }

        (chunks, failures)
    }

    pub fn estimate_chunks_needed(&self, batch: &RowBatch) -> usize {
        let base = self.base_overhead(&batch.table, &batch.columns);
        let mut chunks = 0usize;
        let mut current_size = base;
        let mut has_rows = false;
        for row in &batch.rows {
            let row_size = Self::format_row(row).len();
            let separator = if has_rows { 2 } else { 0 };
            if has_rows && current_size + row_size + separator > self.max_bytes {
                chunks += 1;
                current_size = base;
                has_rows = false;
            }
            current_size += row_size + if has_rows { 2 } else { 0 };
            has_rows = true;
        }
        if has_rows {
            chunks += 1;
        }
        chunks
    }
}

/// Serializes a single cell per the escaping rules: null -> `NULL`;
/// bool -> `1`/`0`; NaN/+-inf -> `NULL`; blob -> `X'<lowercase hex>'`;
/// text -> single-quoted, inner quotes doubled, embedded NUL stripped.
pub fn escape_value(value: &CellValue) -> String {
    match value {
        CellValue::Null => "NULL".to_string(),
        CellValue::Bool(b) => if *b { "1".to_string() } else { "0".to_string() },
        CellValue::Int(i) => i.to_string(),
        CellValue::Float(f) => {
            if f.is_nan() || f.is_infinite() {
                "NULL".to_string()
            } else {
                format!("{f}")
            }
        }
        CellValue::Blob(bytes) => format!("X'{}'", hex::encode(bytes)),
        CellValue::Text(text) => {
            let cleaned: String = text.chars().filter(|c| *c != '\0').collect();
            format!("'{}'", cleaned.replace('\'', "''"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(rows: Vec<Vec<CellValue>>) -> RowBatch {
        RowBatch {
            table: "users".to_string(),
            columns: vec!["id".to_string(), "name".to_string()],
            rows,
            start_offset: 0,
            fingerprint: String::new(),
        }
    }

    #[test]
    fn escape_value_handles_all_documented_cases() {
        assert_eq!(escape_value(&CellValue::Null), "NULL");
        assert_eq!(escape_value(&CellValue::Bool(true)), "1");
        assert_eq!(escape_value(&CellValue::Float(f64::NAN)), "NULL");
        assert_eq!(escape_value(&CellValue::Float(f64::INFINITY)), "NULL");
        assert_eq!(
            escape_value(&CellValue::Blob(vec![0xDE, 0xAD, 0xBE, 0xEF])),
            "X'deadbeef'"
        );
        assert_eq!(
            escape_value(&CellValue::Text("O'Reilly\nX".to_string())),
            "'O''Reilly\nX'"
        );
        assert_eq!(
            escape_value(&CellValue::Text("a\0b".to_string())),
            "'ab'"
        );
    }

    #[test]
    fn chunk_coverage_has_no_gaps_or_overlaps() {
        let rows: Vec<Vec<CellValue>> = (1..=5)
            .map(|i| vec![CellValue::Int(i), CellValue::Text(format!("name{i}"))])
            .collect();
        let chunker = SqlChunker::new(100_000, 1.0, false);
        let (chunks, failures) = chunker.chunk_rows(&batch(rows));
        assert!(failures.is_empty());
        let mut expected_start = 0u64;
        for chunk in &chunks {
            assert_eq!(chunk.start_offset, expected_start);
            expected_start = chunk.end_offset;
        }
        assert_eq!(expected_start, 5);
    }

    #[test]
    fn chunks_respect_the_byte_ceiling() {
        let rows: Vec<Vec<CellValue>> = (1..=5)
            .map(|i| vec![CellValue::Int(i), CellValue::Text(format!("name-{i}"))])
            .collect();
        let chunker = SqlChunker::new(120, 1.0, false);
        let (chunks, failures) = chunker.chunk_rows(&batch(rows));
        assert!(failures.is_empty());
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.byte_size <= 120);
        }
        let total_rows: usize = chunks.iter().map(|c| c.row_count).sum();
        assert_eq!(total_rows, 5);
    }

    #[test]
    fn oversize_single_row_is_reported_without_halting_others() {
        let rows = vec![
            vec![CellValue::Int(1), CellValue::Text("x".repeat(200))],
            vec![CellValue::Int(2), CellValue::Text("short".to_string())],
        ];
        let chunker = SqlChunker::new(100, 1.0, false);
        let (chunks, failures) = chunker.chunk_rows(&batch(rows));
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], SyncError::OversizeRow { offset: 0, .. }));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].row_count, 1);
    }

    #[test]
    fn overwrite_flag_selects_insert_or_replace() {
        let chunker = SqlChunker::new(100_000, 1.0, true);
        let (chunks, _) = chunker.chunk_rows(&batch(vec![vec![CellValue::Int(1), CellValue::Null]]));
        assert!(chunks[0].sql.starts_with("INSERT OR REPLACE"));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_cell() -> impl Strategy<Value = CellValue> {
        prop_oneof![
            Just(CellValue::Null),
            any::<bool>().prop_map(CellValue::Bool),
            any::<i64>().prop_map(CellValue::Int),
            "[a-zA-Z0-9 '\"\\n]{0,24}".prop_map(CellValue::Text),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(CellValue::Blob),
        ]
    }

    /// Rows of a single batch always share a column count; picking it once
    /// up front keeps generated batches realistic.
    fn arb_batch_rows() -> impl Strategy<Value = Vec<Vec<CellValue>>> {
        (1usize..5).prop_flat_map(|ncols| {
            proptest::collection::vec(proptest::collection::vec(arb_cell(), ncols..=ncols), 1..30)
        })
    }

    proptest! {
        /// No chunk ever exceeds the effective byte ceiling, whatever rows
        /// are thrown at the chunker (the §8 "chunk size bound" property).
        #[test]
        fn chunk_size_never_exceeds_the_ceiling(rows in arb_batch_rows()) {
            let columns: Vec<String> = (0..rows[0].len()).map(|i| format!("c{i}")).collect();
            let b = RowBatch {
                table: "t".to_string(),
                columns,
                rows,
                start_offset: 0,
                fingerprint: String::new(),
            };
            let chunker = SqlChunker::new(512, 1.0, false);
            let (chunks, _failures) = chunker.chunk_rows(&b);
            for chunk in &chunks {
                prop_assert!(chunk.byte_size <= 512);
            }
        }

        /// Every row lands in exactly one chunk or exactly one failure,
        /// with chunk offsets forming a contiguous, non-overlapping
        /// partition of the batch (the §8 "chunk coverage" property).
        #[test]
        fn chunk_coverage_partitions_every_row(rows in arb_batch_rows()) {
            let columns: Vec<String> = (0..rows[0].len()).map(|i| format!("c{i}")).collect();
            let row_count = rows.len() as u64;
            let b = RowBatch {
                table: "t".to_string(),
                columns,
                rows,
                start_offset: 0,
                fingerprint: String::new(),
            };
            let chunker = SqlChunker::new(512, 1.0, false);
            let (chunks, failures) = chunker.chunk_rows(&b);

            let mut expected_start = 0u64;
            for chunk in &chunks {
                prop_assert_eq!(chunk.start_offset, expected_start);
                expected_start = chunk.end_offset;
            }
            let covered: u64 = chunks.iter().map(|c| c.row_count as u64).sum();
            prop_assert_eq!(covered + failures.len() as u64, row_count);
        }

        /// Unescaping a `CellValue::Text` cell (undoubling `''` inside the
        /// quoted literal) recovers the original text with embedded NULs
        /// stripped — the §8 "escape round-trip" property for the one
        /// variant SQLite quoting rules actually transform.
        #[test]
        fn text_escape_round_trips_through_quote_doubling(text in "[a-zA-Z0-9 '\"\\n]{0,40}") {
            let escaped = escape_value(&CellValue::Text(text.clone()));
            prop_assert!(escaped.starts_with('\'') && escaped.ends_with('\''));
            let inner = &escaped[1..escaped.len() - 1];
            let unescaped = inner.replace("''", "'");
            let cleaned: String = text.chars().filter(|c| *c != '\0').collect();
            prop_assert_eq!(unescaped, cleaned);
        }
    }
}
