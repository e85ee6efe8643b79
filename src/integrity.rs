use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::config::ChecksumAlgorithm;
use crate::error::{Result, SyncError};
use crate::types::CellValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlg {
    Md5,
    Sha256,
}

impl From<ChecksumAlgorithm> for ChecksumAlg {
    fn from(value: ChecksumAlgorithm) -> Self {
        match value {
            ChecksumAlgorithm::Md5 => ChecksumAlg::Md5,
            ChecksumAlgorithm::Sha256 => ChecksumAlg::Sha256,
        }
    }
}

fn digest_hex(alg: ChecksumAlg, bytes: &[u8]) -> String {
    match alg {
        ChecksumAlg::Md5 => format!("{:x}", md5::compute(bytes)),
        ChecksumAlg::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            hex::encode(hasher.finalize())
        }
    }
}

/// Canonical per-cell encoding: null -> `\N`; bytes -> lowercase hex;
/// bool -> `1`/`0`; everything else -> its string form.
fn canonical_cell(cell: &CellValue) -> String {
    match cell {
        CellValue::Null => "\\N".to_string(),
        CellValue::Blob(b) => hex::encode(b),
        CellValue::Bool(b) => if *b { "1".to_string() } else { "0".to_string() },
        CellValue::Int(i) => i.to_string(),
        CellValue::Float(f) => f.to_string(),
        CellValue::Text(s) => s.clone(),
    }
}

fn canonical_row(row: &[CellValue]) -> String {
    row.iter().map(canonical_cell).collect::<Vec<_>>().join("|")
}

pub fn row_checksum(row: &[CellValue], alg: ChecksumAlg) -> String {
    digest_hex(alg, canonical_row(row).as_bytes())
}

/// A batch hash is the digest of the concatenation of per-row hex digests.
pub fn batch_checksum(rows: &[Vec<CellValue>], alg: ChecksumAlg) -> String {
    let concatenated: String = rows.iter().map(|r| row_checksum(r, alg)).collect();
    digest_hex(alg, concatenated.as_bytes())
}

/// Used by the source reader to fingerprint a batch as it is read.
pub fn fingerprint_cells(rows: &[Vec<CellValue>], alg: ChecksumAlg) -> String {
    batch_checksum(rows, alg)
}

/// Table hash equals the batch hash over all rows in deterministic order.
pub fn table_checksum(rows: &[Vec<CellValue>], alg: ChecksumAlg) -> String {
    batch_checksum(rows, alg)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchKind {
    MissingInDest,
    ChecksumMismatch,
    ExtraInDest,
}

#[derive(Debug, Clone)]
pub struct Mismatch {
    pub key: String,
    pub kind: MismatchKind,
}

#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub source_row_count: u64,
    pub dest_row_count: u64,
    pub mismatches: Vec<Mismatch>,
}

impl VerificationResult {
    pub fn counts_match(&self) -> bool {
        self.source_row_count == self.dest_row_count
    }
}

/// Computes a canonical key for the given column index of a row.
fn key_of(row: &[CellValue], key_column: usize) -> String {
    row.get(key_column).map(canonical_cell).unwrap_or_default()
}

/// Given source and destination row lists and a key-column index, classify
/// every source row as `missing_in_dest`, `checksum_mismatch`, or matched
/// (removed from the destination map); remaining destination entries
/// classify as `extra_in_dest`. Output preserves source iteration order
/// followed by alphabetically-ordered extras.
pub fn find_mismatches(
    source_rows: &[Vec<CellValue>],
    dest_rows: &[Vec<CellValue>],
    key_column: usize,
    alg: ChecksumAlg,
) -> Vec<Mismatch> {
    let mut dest_map: HashMap<String, String> = HashMap::new();
    for row in dest_rows {
        dest_map.insert(key_of(row, key_column), row_checksum(row, alg));
    }

    let mut mismatches = Vec::new();
    for row in source_rows {
        let key = key_of(row, key_column);
        match dest_map.remove(&key) {
            None => mismatches.push(Mismatch {
                key,
                kind: MismatchKind::MissingInDest,
            }),
            Some(dest_hash) => {
                let source_hash = row_checksum(row, alg);
                if source_hash != dest_hash {
                    mismatches.push(Mismatch {
                        key,
                        kind: MismatchKind::ChecksumMismatch,
                    });
                }
            }
        }
    }

    let mut extras: Vec<String> = dest_map.into_keys().collect();
    extras.sort();
    mismatches.extend(extras.into_iter().map(|key| Mismatch {
        key,
        kind: MismatchKind::ExtraInDest,
    }));

    mismatches
}

pub fn compare_checksums(a: &str, b: &str) -> bool {
    a == b
}

pub struct IntegrityChecker {
    algorithm: ChecksumAlg,
}

impl IntegrityChecker {
    pub fn new(algorithm: ChecksumAlgorithm) -> Result<Self> {
        Ok(IntegrityChecker {
            algorithm: algorithm.into(),
        })
    }

    pub fn from_name(name: &str) -> Result<Self> {
        let algorithm = match name {
            "md5" => ChecksumAlgorithm::Md5,
            "sha256" => ChecksumAlgorithm::Sha256,
            other => {
                return Err(SyncError::Config(format!(
                    "unknown checksum algorithm '{other}', expected md5 or sha256"
                )))
            }
        };
        Self::new(algorithm)
    }

    pub fn row_checksum(&self, row: &[CellValue]) -> String {
        row_checksum(row, self.algorithm)
    }

    pub fn batch_checksum(&self, rows: &[Vec<CellValue>]) -> String {
        batch_checksum(rows, self.algorithm)
    }

    pub fn table_checksum(&self, rows: &[Vec<CellValue>]) -> String {
        table_checksum(rows, self.algorithm)
    }

    pub fn find_mismatches(
        &self,
        source_rows: &[Vec<CellValue>],
        dest_rows: &[Vec<CellValue>],
        key_column: usize,
    ) -> Vec<Mismatch> {
        find_mismatches(source_rows, dest_rows, key_column, self.algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(v: Vec<CellValue>) -> Vec<CellValue> {
        v
    }

    #[test]
    fn table_checksum_is_stable_across_calls() {
        let rows = vec![row(vec![CellValue::Int(1), CellValue::Text("Alice".into())])];
        let a = table_checksum(&rows, ChecksumAlg::Md5);
        let b = table_checksum(&rows, ChecksumAlg::Md5);
        assert_eq!(a, b);
    }

    #[test]
    fn table_checksum_independent_of_batch_split() {
        let rows = vec![
            row(vec![CellValue::Int(1), CellValue::Text("Alice".into())]),
            row(vec![CellValue::Int(2), CellValue::Text("Bob".into())]),
        ];
        let whole = table_checksum(&rows, ChecksumAlg::Sha256);
        // splitting into batches and re-concatenating the per-row digests
        // must produce the same table-level hash regardless of split point.
        let split_a = batch_checksum(&rows[0..1], ChecksumAlg::Sha256);
        let split_b = batch_checksum(&rows[1..2], ChecksumAlg::Sha256);
        let combined = digest_hex(
            ChecksumAlg::Sha256,
            format!(
                "{}{}",
                row_checksum(&rows[0], ChecksumAlg::Sha256),
                row_checksum(&rows[1], ChecksumAlg::Sha256)
            )
            .as_bytes(),
        );
        assert_eq!(whole, combined);
        assert_ne!(split_a, split_b);
    }

    #[test]
    fn find_mismatches_classifies_all_three_kinds() {
        let source = vec![
            row(vec![CellValue::Int(1), CellValue::Text("Alice".into())]),
            row(vec![CellValue::Int(2), CellValue::Text("Bob".into())]),
            row(vec![CellValue::Int(3), CellValue::Text("Carol".into())]),
        ];
        let dest = vec![
            row(vec![CellValue::Int(1), CellValue::Text("Alice".into())]),
            row(vec![CellValue::Int(2), CellValue::Text("Bobby".into())]),
            row(vec![CellValue::Int(4), CellValue::Text("Dave".into())]),
        ];
        let mismatches = find_mismatches(&source, &dest, 0, ChecksumAlg::Md5);
        assert_eq!(mismatches.len(), 3);
        assert_eq!(mismatches[0].key, "2");
        assert_eq!(mismatches[0].kind, MismatchKind::ChecksumMismatch);
        assert_eq!(mismatches[1].key, "3");
        assert_eq!(mismatches[1].kind, MismatchKind::MissingInDest);
        assert_eq!(mismatches[2].key, "4");
        assert_eq!(mismatches[2].kind, MismatchKind::ExtraInDest);
    }

    #[test]
    fn canonical_cell_encodes_null_and_bool() {
        assert_eq!(canonical_cell(&CellValue::Null), "\\N");
        assert_eq!(canonical_cell(&CellValue::Bool(true)), "1");
        assert_eq!(canonical_cell(&CellValue::Bool(false)), "0");
    }
}
