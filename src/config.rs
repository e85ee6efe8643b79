use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

/// Per-tier resource ceilings. Mirrors the free/paid profiles of the
/// original configuration model; validated once at construction and
/// never mutated in place during a sync.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    pub max_sql_bytes: usize,
    pub max_rows_per_batch: u64,
    pub max_query_duration_secs: u64,
    pub max_bound_params: usize,
    pub daily_row_reads: Option<u64>,
    pub daily_row_writes: Option<u64>,
    pub batch_safety_margin: f64,
    pub concurrent_batches: u32,
}

impl Limits {
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Free => Limits {
                max_sql_bytes: 100 * 1024,
                max_rows_per_batch: 100,
                max_query_duration_secs: 30,
                max_bound_params: 100,
                daily_row_reads: Some(5_000_000),
                daily_row_writes: Some(100_000),
                batch_safety_margin: 0.85,
                concurrent_batches: 1,
            },
            Tier::Paid => Limits {
                max_sql_bytes: 100 * 1024,
                max_rows_per_batch: 500,
                max_query_duration_secs: 30,
                max_bound_params: 100,
                daily_row_reads: None,
                daily_row_writes: None,
                batch_safety_margin: 0.90,
                concurrent_batches: 3,
            },
        }
    }

    /// `max_sql_bytes * batch_safety_margin`, the effective ceiling a chunk must fit under.
    pub fn effective_byte_ceiling(&self) -> usize {
        (self.max_sql_bytes as f64 * self.batch_safety_margin) as usize
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !(0.5..=1.0).contains(&self.batch_safety_margin) {
            problems.push(format!(
                "batch_safety_margin must be within [0.5, 1.0], got {}",
                self.batch_safety_margin
            ));
        }
        if self.concurrent_batches == 0 || self.concurrent_batches > 6 {
            problems.push(format!(
                "concurrent_batches must be within [1, 6], got {}",
                self.concurrent_batches
            ));
        }
        if self.max_sql_bytes == 0 {
            problems.push("max_sql_bytes must be positive".to_string());
        }
        problems
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub overwrite: bool,
    pub tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub sync_schema: bool,
    pub drop_before_sync: bool,
    pub verify_after_sync: bool,
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
    pub batch_size_override: Option<u64>,
    pub resume: bool,
    pub state_file: String,
}

impl SyncOptions {
    pub fn defaults() -> Self {
        SyncOptions {
            dry_run: false,
            overwrite: false,
            tables: Vec::new(),
            exclude_tables: Vec::new(),
            limit: None,
            offset: None,
            sync_schema: true,
            drop_before_sync: false,
            verify_after_sync: true,
            checksum_algorithm: Some(ChecksumAlgorithm::Md5),
            batch_size_override: None,
            resume: true,
            state_file: ".d1-sync-state.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Rich,
    Json,
    Simple,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
    pub failed_rows_file: String,
    pub max_file_size_mb: u64,
    pub backup_count: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Rich,
            failed_rows_file: "failed_rows.json".to_string(),
            max_file_size_mb: 10,
            backup_count: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub source_path: Option<String>,
    pub source_url: Option<String>,
}

/// Top-level configuration record. Built explicitly, validated once via
/// [`Settings::validate_credentials`], and never mutated in place during a
/// sync — callers that need to adjust an option clone the struct first.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cloudflare_api_token: String,
    pub cloudflare_account_id: String,
    pub database_name: String,
    pub database_id: String,
    pub tier: Tier,
    pub limits: Limits,
    pub sync: SyncOptions,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
}

impl Settings {
    pub fn new(
        cloudflare_api_token: impl Into<String>,
        cloudflare_account_id: impl Into<String>,
        database_name: impl Into<String>,
        database_id: impl Into<String>,
        tier: Tier,
    ) -> Self {
        Settings {
            cloudflare_api_token: cloudflare_api_token.into(),
            cloudflare_account_id: cloudflare_account_id.into(),
            database_name: database_name.into(),
            database_id: database_id.into(),
            tier,
            limits: Limits::for_tier(tier),
            sync: SyncOptions::defaults(),
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
        }
    }

    pub fn validate_credentials(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.cloudflare_api_token.trim().is_empty() {
            problems.push("cloudflare_api_token is required".to_string());
        }
        if self.cloudflare_account_id.trim().is_empty() {
            problems.push("cloudflare_account_id is required".to_string());
        }
        if self.database_id.trim().is_empty() && self.database_name.trim().is_empty() {
            problems.push("either database_id or database_name is required".to_string());
        }
        problems.extend(self.limits.validate());
        problems
    }

    /// A stable fingerprint of the configuration fields that, if changed,
    /// should invalidate a resumed state (§3 "settings fingerprint").
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.database_id.as_bytes());
        hasher.update(self.database_name.as_bytes());
        hasher.update([self.sync.overwrite as u8]);
        hasher.update([self.sync.sync_schema as u8]);
        hasher.update(self.limits.max_sql_bytes.to_le_bytes());
        hasher.update(self.limits.max_rows_per_batch.to_le_bytes());
        hasher.update(self.limits.batch_safety_margin.to_le_bytes());
        let mut sorted_tables = self.sync.tables.clone();
        sorted_tables.sort();
        for t in &sorted_tables {
            hasher.update(t.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_tier_has_single_concurrent_batch() {
        assert_eq!(Limits::for_tier(Tier::Free).concurrent_batches, 1);
    }

    #[test]
    fn paid_tier_has_no_daily_caps() {
        let limits = Limits::for_tier(Tier::Paid);
        assert!(limits.daily_row_reads.is_none());
        assert!(limits.daily_row_writes.is_none());
    }

    #[test]
    fn fingerprint_changes_with_overwrite_flag() {
        let mut settings = Settings::new("tok", "acct", "db", "id", Tier::Free);
        let a = settings.fingerprint();
        settings.sync.overwrite = true;
        let b = settings.fingerprint();
        assert_ne!(a, b);
    }

    #[test]
    fn validate_credentials_catches_missing_token() {
        let settings = Settings::new("", "acct", "db", "id", Tier::Free);
        assert!(!settings.validate_credentials().is_empty());
    }
}
