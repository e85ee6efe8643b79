use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};

const BASE_URL: &str = "https://api.cloudflare.com/client/v4";
const MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;
const RETRY_DELAY_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub retry_after_secs: Option<u64>,
    pub body: String,
}

/// Abstracts the raw HTTP call a [`RemoteClient`] makes, so tests can
/// substitute a scripted transport instead of hitting the network. The
/// production path is [`ReqwestTransport`].
#[async_trait::async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, String>;
}

/// The `reqwest`-backed transport used outside of tests.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(max_query_duration_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(max_query_duration_secs + 10))
            .build()?;
        Ok(ReqwestTransport { client })
    }
}

#[async_trait::async_trait]
impl RemoteTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, String> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
            HttpMethod::Put => self.client.put(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().await.map_err(|err| err.to_string())?;
        let status = response.status().as_u16();
        let retry_after_secs = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let body = response.text().await.map_err(|err| err.to_string())?;
        Ok(HttpResponse {
            status,
            retry_after_secs,
            body,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct QueryRequest<'a> {
    sql: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize, Clone)]
struct ApiError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct QueryResultEnvelope {
    #[serde(default)]
    results: Vec<serde_json::Value>,
    meta: QueryMeta,
}

#[derive(Debug, Deserialize, Default)]
struct QueryMeta {
    #[serde(default)]
    rows_read: u64,
    #[serde(default)]
    rows_written: u64,
    #[serde(default)]
    duration: f64,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Vec<serde_json::Value>,
    pub rows_read: u64,
    pub rows_written: u64,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ImportResult {
    pub rows_written: u64,
}

/// Executes database operations over HTTP. Every failure mode surfaces as
/// a structured [`SyncError`] variant rather than a raw transport
/// exception — the orchestrator decides what to do with each one.
///
/// Cheap to clone (the transport is held behind an `Arc`); the
/// orchestrator clones it to dispatch chunks for the same table
/// concurrently.
#[derive(Clone)]
pub struct RemoteClient {
    transport: Arc<dyn RemoteTransport>,
    account_id: String,
    database_id: String,
    api_token: String,
    #[allow(dead_code)]
    max_query_duration_secs: u64,
    poll_interval_secs: u64,
    max_wait_secs: u64,
}

impl RemoteClient {
    pub fn new(
        account_id: impl Into<String>,
        database_id: impl Into<String>,
        api_token: impl Into<String>,
        max_query_duration_secs: u64,
    ) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(max_query_duration_secs)?);
        Ok(Self::with_transport(
            transport,
            account_id,
            database_id,
            api_token,
            max_query_duration_secs,
        ))
    }

    /// Builds a client over a caller-supplied transport — the seam tests
    /// use to substitute a scripted transport instead of the network.
    pub fn with_transport(
        transport: Arc<dyn RemoteTransport>,
        account_id: impl Into<String>,
        database_id: impl Into<String>,
        api_token: impl Into<String>,
        max_query_duration_secs: u64,
    ) -> Self {
        RemoteClient {
            transport,
            account_id: account_id.into(),
            database_id: database_id.into(),
            api_token: api_token.into(),
            max_query_duration_secs,
            poll_interval_secs: 2,
            max_wait_secs: 300,
        }
    }

    fn database_url(&self) -> String {
        format!(
            "{BASE_URL}/accounts/{}/d1/database/{}",
            self.account_id, self.database_id
        )
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_token)
    }

    async fn request_with_retry(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<ApiEnvelopeRaw> {
        let mut attempt = 0u32;
        loop {
            let mut headers = vec![("Authorization".to_string(), self.auth_header())];
            if body.is_some() {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
            }
            let request = HttpRequest {
                method,
                url: url.to_string(),
                headers,
                body: body.clone(),
            };
            let response = self.transport.send(request).await;

            let response = match response {
                Ok(r) => r,
                Err(message) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        error!(attempts = attempt, error = %message, "remote request failed after retries");
                        return Err(SyncError::Transport {
                            attempts: attempt,
                            message,
                        });
                    }
                    let delay = RETRY_DELAY_SECS * (attempt as u64 + 1);
                    warn!(attempt, delay, "transport error, retrying");
                    sleep(Duration::from_secs(delay)).await;
                    continue;
                }
            };

            if response.status == 429 {
                let retry_after = response.retry_after_secs.unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                attempt += 1;
                if attempt >= MAX_RETRIES {
                    return Err(SyncError::RateLimited {
                        retry_after_secs: retry_after,
                    });
                }
                info!(retry_after, attempt, "rate limited, sleeping before retry");
                sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            if !(200..300).contains(&response.status) {
                error!(status = response.status, "remote request returned non-success status");
                return Err(SyncError::Remote {
                    code: response.status.to_string(),
                    message: response.body,
                });
            }

            return Ok(ApiEnvelopeRaw { body: response.body });
        }
    }

    /// A single-statement result with rows-read/rows-written/duration metadata.
    pub async fn execute(&self, sql: &str) -> Result<QueryResult> {
        let url = format!("{}/query", self.database_url());
        let payload = QueryRequest { sql, params: None };
        let body = serde_json::to_vec(&payload)?;
        let raw = self
            .request_with_retry(HttpMethod::Post, &url, Some(body))
            .await?;

        let envelope: ApiEnvelope<Vec<QueryResultEnvelope>> = serde_json::from_str(&raw.body)?;
        if !envelope.success {
            return Err(map_semantic_error(&envelope.errors));
        }
        let result = envelope
            .result
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
            .unwrap_or(QueryResultEnvelope {
                results: Vec::new(),
                meta: QueryMeta::default(),
            });
        Ok(QueryResult {
            rows: result.results,
            rows_read: result.meta.rows_read,
            rows_written: result.meta.rows_written,
            duration_ms: result.meta.duration,
        })
    }

    /// An ordered list of per-statement results for a single HTTP call.
    pub async fn execute_batch(&self, stmts: &[String]) -> Result<Vec<QueryResult>> {
        let url = format!("{}/query", self.database_url());
        let payload: Vec<QueryRequest> = stmts
            .iter()
            .map(|sql| QueryRequest { sql, params: None })
            .collect();
        let body = serde_json::to_vec(&payload)?;
        let raw = self
            .request_with_retry(HttpMethod::Post, &url, Some(body))
            .await?;

        let envelope: ApiEnvelope<Vec<QueryResultEnvelope>> = serde_json::from_str(&raw.body)?;
        if !envelope.success {
            return Err(map_semantic_error(&envelope.errors));
        }
        Ok(envelope
            .result
            .unwrap_or_default()
            .into_iter()
            .map(|r| QueryResult {
                rows: r.results,
                rows_read: r.meta.rows_read,
                rows_written: r.meta.rows_written,
                duration_ms: r.meta.duration,
            })
            .collect())
    }

    pub async fn get_tables(&self) -> Result<Vec<String>> {
        let result = self
            .execute(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '\\_cf\\_%' ESCAPE '\\'",
            )
            .await?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.get("name").and_then(|v| v.as_str()).map(str::to_string))
            .collect())
    }

    pub async fn get_table_count(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) AS n FROM \"{}\"", table.replace('"', "\"\""));
        let result = self.execute(&sql).await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.get("n"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }

    pub async fn get_database_info(&self) -> Result<serde_json::Value> {
        let url = self.database_url();
        let raw = self.request_with_retry(HttpMethod::Get, &url, None).await?;
        let envelope: ApiEnvelope<serde_json::Value> = serde_json::from_str(&raw.body)?;
        if !envelope.success {
            return Err(map_semantic_error(&envelope.errors));
        }
        Ok(envelope.result.unwrap_or(serde_json::Value::Null))
    }

    /// Bulk ingest pipeline: init (MD5 etag) -> upload (raw bytes) ->
    /// ingest -> poll until complete, failed, or `max_wait` elapses.
    pub async fn import_sql(&self, sql: &str) -> Result<ImportResult> {
        let digest = format!("{:x}", md5::compute(sql.as_bytes()));
        let (upload_url, filename) = self.init_import(&digest).await?;
        self.upload_to_r2(&upload_url, sql.as_bytes()).await?;
        self.start_ingestion(&filename).await?;
        self.poll_import_status(&filename).await
    }

    async fn init_import(&self, etag: &str) -> Result<(String, String)> {
        let url = format!("{}/import", self.database_url());
        let body = serde_json::to_vec(&serde_json::json!({ "action": "init", "etag": etag }))?;
        let raw = self
            .request_with_retry(HttpMethod::Post, &url, Some(body))
            .await?;
        let envelope: ApiEnvelope<serde_json::Value> = serde_json::from_str(&raw.body)?;
        if !envelope.success {
            return Err(map_semantic_error(&envelope.errors));
        }
        let result = envelope.result.unwrap_or(serde_json::Value::Null);
        let upload_url = result
            .get("upload_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::ImportFailed("init response missing upload_url".into()))?
            .to_string();
        let filename = result
            .get("filename")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::ImportFailed("init response missing filename".into()))?
            .to_string();
        Ok((upload_url, filename))
    }

    async fn upload_to_r2(&self, upload_url: &str, bytes: &[u8]) -> Result<()> {
        let request = HttpRequest {
            method: HttpMethod::Put,
            url: upload_url.to_string(),
            headers: vec![("Content-Type".to_string(), "application/octet-stream".to_string())],
            body: Some(bytes.to_vec()),
        };
        let response = self.transport.send(request).await.map_err(|message| SyncError::Transport {
            attempts: 1,
            message,
        })?;
        if !(200..300).contains(&response.status) {
            return Err(SyncError::ImportFailed(format!(
                "upload failed with status {}",
                response.status
            )));
        }
        Ok(())
    }

    async fn start_ingestion(&self, filename: &str) -> Result<()> {
        let url = format!("{}/import", self.database_url());
        let body =
            serde_json::to_vec(&serde_json::json!({ "action": "ingest", "filename": filename }))?;
        let raw = self
            .request_with_retry(HttpMethod::Post, &url, Some(body))
            .await?;
        let envelope: ApiEnvelope<serde_json::Value> = serde_json::from_str(&raw.body)?;
        if !envelope.success {
            return Err(map_semantic_error(&envelope.errors));
        }
        Ok(())
    }

    async fn poll_import_status(&self, filename: &str) -> Result<ImportResult> {
        let url = format!("{}/import", self.database_url());
        let started = std::time::Instant::now();
        loop {
            if started.elapsed().as_secs() > self.max_wait_secs {
                return Err(SyncError::ImportTimeout {
                    elapsed_secs: started.elapsed().as_secs(),
                });
            }
            let body = serde_json::to_vec(
                &serde_json::json!({ "action": "poll", "filename": filename }),
            )?;
            let raw = self
                .request_with_retry(HttpMethod::Post, &url, Some(body))
                .await?;
            let envelope: ApiEnvelope<serde_json::Value> = serde_json::from_str(&raw.body)?;
            if !envelope.success {
                return Err(map_semantic_error(&envelope.errors));
            }
            let result = envelope.result.unwrap_or(serde_json::Value::Null);
            let status = result.get("status").and_then(|v| v.as_str()).unwrap_or("pending");
            debug!(status, filename, "polled bulk import status");
            match status {
                "complete" => {
                    let rows_written = result
                        .get("num_rows_written")
                        .or_else(|| result.get("rows_written"))
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    return Ok(ImportResult { rows_written });
                }
                "failed" => {
                    let message = result
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("bulk import failed")
                        .to_string();
                    return Err(SyncError::ImportFailed(message));
                }
                _ => {
                    sleep(Duration::from_secs(self.poll_interval_secs)).await;
                }
            }
        }
    }

    /// Convenience wrapper over `execute` using numbered parameter
    /// placeholders; not used by the push/pull orchestrator (see the
    /// resolved Open Question on per-row fallback in SPEC_FULL.md).
    pub async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<String>],
        replace: bool,
    ) -> Result<u64> {
        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT OR IGNORE" };
        let column_list = columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let mut written = 0u64;
        for row in rows {
            let placeholders = (1..=row.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("{verb} INTO \"{table}\" ({column_list}) VALUES ({placeholders})");
            let url = format!("{}/query", self.database_url());
            let payload = QueryRequest {
                sql: &sql,
                params: Some(row),
            };
            let body = serde_json::to_vec(&payload)?;
            let raw = self
                .request_with_retry(HttpMethod::Post, &url, Some(body))
                .await?;
            let envelope: ApiEnvelope<Vec<QueryResultEnvelope>> = serde_json::from_str(&raw.body)?;
            if !envelope.success {
                return Err(map_semantic_error(&envelope.errors));
            }
            written += envelope
                .result
                .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
                .map(|r| r.meta.rows_written)
                .unwrap_or(0);
        }
        Ok(written)
    }
}

struct ApiEnvelopeRaw {
    body: String,
}

/// Maps a `success:false` response body into a semantic error per §4.3:
/// inspect the first error's message and classify oversize / timeout /
/// generic remote failures.
fn map_semantic_error(errors: &[ApiError]) -> SyncError {
    let first = errors.first().cloned().unwrap_or(ApiError {
        code: 0,
        message: "unknown remote error".to_string(),
    });
    let lowered = first.message.to_lowercase();
    if lowered.contains("statement too long") {
        SyncError::Remote {
            code: "oversize".to_string(),
            message: first.message,
        }
    } else if lowered.contains("timeout") {
        SyncError::Remote {
            code: "query-timeout".to_string(),
            message: first.message,
        }
    } else {
        SyncError::Remote {
            code: first.code.to_string(),
            message: first.message,
        }
    }
}

/// A transport that replays a fixed script of responses, one per call,
/// and counts how many calls it received — the seam the retry tests use
/// instead of hitting the network.
struct ScriptedTransport {
    responses: std::sync::Mutex<std::collections::VecDeque<HttpResponse>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl ScriptedTransport {
    fn new(responses: Vec<HttpResponse>) -> Self {
        ScriptedTransport {
            responses: std::sync::Mutex::new(responses.into_iter().collect()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RemoteTransport for ScriptedTransport {
    async fn send(&self, _request: HttpRequest) -> std::result::Result<HttpResponse, String> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| "scripted transport ran out of responses".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripted_client(responses: Vec<HttpResponse>) -> (RemoteClient, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(responses));
        let client = RemoteClient::with_transport(transport.clone(), "acct", "db", "token", 30);
        (client, transport)
    }

    #[tokio::test]
    async fn execute_retries_twice_on_rate_limit_then_succeeds() {
        let success_body = serde_json::json!({
            "success": true,
            "result": [{
                "results": [],
                "meta": { "rows_read": 0, "rows_written": 0, "duration": 0.0 }
            }]
        })
        .to_string();
        let (client, transport) = scripted_client(vec![
            HttpResponse { status: 429, retry_after_secs: Some(0), body: String::new() },
            HttpResponse { status: 429, retry_after_secs: Some(0), body: String::new() },
            HttpResponse { status: 200, retry_after_secs: None, body: success_body },
        ]);

        let result = client.execute("SELECT 1").await.unwrap();

        assert_eq!(transport.call_count(), 3);
        assert_eq!(result.rows_read, 0);
    }

    #[tokio::test]
    async fn execute_gives_up_after_max_retries_of_rate_limiting() {
        let (client, transport) = scripted_client(vec![
            HttpResponse { status: 429, retry_after_secs: Some(0), body: String::new() },
            HttpResponse { status: 429, retry_after_secs: Some(0), body: String::new() },
            HttpResponse { status: 429, retry_after_secs: Some(7), body: String::new() },
        ]);

        let err = client.execute("SELECT 1").await.unwrap_err();

        assert_eq!(transport.call_count(), 3);
        match err {
            SyncError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 7),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn map_semantic_error_classifies_oversize() {
        let err = map_semantic_error(&[ApiError {
            code: 1,
            message: "Statement too long: exceeds limit".to_string(),
        }]);
        match err {
            SyncError::Remote { code, .. } => assert_eq!(code, "oversize"),
            _ => panic!("expected Remote error"),
        }
    }

    #[test]
    fn map_semantic_error_classifies_timeout() {
        let err = map_semantic_error(&[ApiError {
            code: 2,
            message: "query Timeout exceeded".to_string(),
        }]);
        match err {
            SyncError::Remote { code, .. } => assert_eq!(code, "query-timeout"),
            _ => panic!("expected Remote error"),
        }
    }

    #[test]
    fn map_semantic_error_falls_back_to_generic() {
        let err = map_semantic_error(&[ApiError {
            code: 7500,
            message: "something else entirely".to_string(),
        }]);
        match err {
            SyncError::Remote { code, .. } => assert_eq!(code, "7500"),
            _ => panic!("expected Remote error"),
        }
    }
}
