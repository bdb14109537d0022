//! Table storage backends + HTTP fetch utilities for the ledger reconciler.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use olr_core::Row;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "olr-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on table {table}: {source}")]
    Io {
        table: String,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error on table {table}: {source}")]
    Csv {
        table: String,
        #[source]
        source: csv::Error,
    },
    #[error("write rejected for table {0}")]
    WriteRejected(String),
    #[error("read rejected for table {0}")]
    ReadRejected(String),
}

/// Named-tab storage contract consumed by the reconciliation engine.
///
/// `write_all_rows` replaces the entire table; implementations must never
/// leave a partially written table behind.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// All rows of the table, header first. A missing table reads as empty.
    async fn read_all_rows(&self, table: &str) -> Result<Vec<Row>, StorageError>;

    async fn write_all_rows(
        &self,
        table: &str,
        header: &[String],
        rows: &[Row],
    ) -> Result<(), StorageError>;

    async fn append_rows(&self, table: &str, rows: &[Row]) -> Result<(), StorageError>;
}

/// Stable sha256 over header + rows, used to fingerprint persisted tables.
pub fn content_sha256(header: &[String], rows: &[Row]) -> String {
    let mut hasher = Sha256::new();
    for row in std::iter::once(header).chain(rows.iter().map(Vec::as_slice)) {
        for cell in row {
            hasher.update(cell.as_bytes());
            hasher.update([0x1f]);
        }
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

/// One CSV file per table under a root directory.
#[derive(Debug, Clone)]
pub struct CsvTableStore {
    root: PathBuf,
}

impl CsvTableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, table: &str) -> PathBuf {
        let file_name: String = table
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '\0' => '_',
                other => other,
            })
            .collect();
        self.root.join(format!("{file_name}.csv"))
    }

    fn encode_rows<'a>(
        table: &str,
        rows: impl IntoIterator<Item = &'a [String]>,
    ) -> Result<Vec<u8>, StorageError> {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .has_headers(false)
            .from_writer(Vec::new());
        for row in rows {
            writer.write_record(row).map_err(|source| StorageError::Csv {
                table: table.to_string(),
                source,
            })?;
        }
        writer.into_inner().map_err(|err| StorageError::Io {
            table: table.to_string(),
            source: std::io::Error::other(err.to_string()),
        })
    }

    async fn ensure_root(&self, table: &str) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::Io {
                table: table.to_string(),
                source,
            })
    }
}

#[async_trait]
impl TableStore for CsvTableStore {
    async fn read_all_rows(&self, table: &str) -> Result<Vec<Row>, StorageError> {
        let path = self.path_for(table);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::Io {
                    table: table.to_string(),
                    source,
                })
            }
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes.as_slice());
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|source| StorageError::Csv {
                table: table.to_string(),
                source,
            })?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        debug!(table, rows = rows.len(), "read csv table");
        Ok(rows)
    }

    /// Overwrite via a temp file in the same directory followed by an atomic rename.
    async fn write_all_rows(
        &self,
        table: &str,
        header: &[String],
        rows: &[Row],
    ) -> Result<(), StorageError> {
        self.ensure_root(table).await?;
        let bytes = Self::encode_rows(
            table,
            std::iter::once(header).chain(rows.iter().map(Vec::as_slice)),
        )?;
        let io_err = |source: std::io::Error| StorageError::Io {
            table: table.to_string(),
            source,
        };

        let final_path = self.path_for(table);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(&bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(source));
        }
        debug!(table, rows = rows.len(), "rewrote csv table");
        Ok(())
    }

    async fn append_rows(&self, table: &str, rows: &[Row]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.ensure_root(table).await?;
        let bytes = Self::encode_rows(table, rows.iter().map(Vec::as_slice))?;
        let io_err = |source: std::io::Error| StorageError::Io {
            table: table.to_string(),
            source,
        };
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(table))
            .await
            .map_err(io_err)?;
        file.write_all(&bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

/// Process-local store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: Mutex<BTreeMap<String, Vec<Row>>>,
    write_counts: Mutex<BTreeMap<String, usize>>,
    fail_writes: AtomicBool,
    unreadable: Mutex<BTreeSet<String>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, table: &str, rows: Vec<Row>) {
        self.tables.lock().await.insert(table.to_string(), rows);
    }

    pub async fn snapshot(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.tables.lock().await.keys().cloned().collect()
    }

    /// Number of full rewrites issued against `table`.
    pub async fn write_count(&self, table: &str) -> usize {
        self.write_counts
            .lock()
            .await
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    /// Make every subsequent write or append fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make reads of one table fail; other tables stay readable.
    pub async fn fail_reads_of(&self, table: &str) {
        self.unreadable.lock().await.insert(table.to_string());
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn read_all_rows(&self, table: &str) -> Result<Vec<Row>, StorageError> {
        if self.unreadable.lock().await.contains(table) {
            return Err(StorageError::ReadRejected(table.to_string()));
        }
        Ok(self.snapshot(table).await)
    }

    async fn write_all_rows(
        &self,
        table: &str,
        header: &[String],
        rows: &[Row],
    ) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteRejected(table.to_string()));
        }
        let mut all = Vec::with_capacity(rows.len() + 1);
        all.push(header.to_vec());
        all.extend(rows.iter().cloned());
        self.tables.lock().await.insert(table.to_string(), all);
        *self
            .write_counts
            .lock()
            .await
            .entry(table.to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn append_rows(&self, table: &str, rows: &[Row]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteRejected(table.to_string()));
        }
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    /// Throttling, request timeouts and server errors are worth another
    /// attempt; everything else, auth failures included, is final.
    pub fn of_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Self::Retryable,
            s if s.is_server_error() => Self::Retryable,
            _ => Self::NonRetryable,
        }
    }

    pub fn of_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }

    fn is_retryable(self) -> bool {
        self == Self::Retryable
    }
}

/// Doubling delay between retries, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Whether a failure on zero-based `attempt` may be followed by another.
    pub fn permits_retry(&self, attempt: usize, disposition: RetryDisposition) -> bool {
        disposition.is_retryable() && attempt < self.max_retries
    }

    pub fn delay_before_retry(&self, attempt: usize) -> Duration {
        u32::try_from(attempt)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .map_or(self.max_delay, |factor| self.base_delay.saturating_mul(factor))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Minimum spacing between consecutive requests.
    pub request_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            request_interval: Duration::from_millis(50),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Authentication failures will not heal on the next request.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 401 | 403, .. })
    }
}

/// Bearer-authenticated JSON client with paced, retried requests.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    request_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            request_interval: config.request_interval,
            last_request: Mutex::new(None),
            backoff: config.backoff,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        bearer: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let body = self
            .send_with_retry(url, || {
                self.client.get(url).bearer_auth(bearer).query(query)
            })
            .await?;
        decode(url, &body)
    }

    pub async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: &str,
        bearer: &str,
        payload: &B,
    ) -> Result<T, FetchError> {
        let body = self
            .send_with_retry(url, || {
                self.client.post(url).bearer_auth(bearer).json(payload)
            })
            .await?;
        decode(url, &body)
    }

    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.request_interval {
                tokio::time::sleep(self.request_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<Vec<u8>, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let span = info_span!("http_fetch", url);
        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                self.pace().await;
                match build().send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            return Ok(resp.bytes().await?.to_vec());
                        }

                        if self
                            .backoff
                            .permits_retry(attempt, RetryDisposition::of_status(status))
                        {
                            debug!(status = status.as_u16(), attempt, "retrying after status");
                            tokio::time::sleep(self.backoff.delay_before_retry(attempt)).await;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if self
                            .backoff
                            .permits_retry(attempt, RetryDisposition::of_error(&err))
                        {
                            debug!(error = %err, attempt, "retrying after transport error");
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_before_retry(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }

            match last_request_error {
                Some(err) => Err(FetchError::Request(err)),
                None => Err(FetchError::HttpStatus {
                    status: 0,
                    url: url.to_string(),
                }),
            }
        }
        .instrument(span)
        .await
    }
}

fn decode<T: DeserializeOwned>(url: &str, body: &[u8]) -> Result<T, FetchError> {
    serde_json::from_slice(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn csv_store_round_trips_ragged_rows() {
        let dir = tempdir().expect("tempdir");
        let store = CsvTableStore::new(dir.path().join("ledger"));
        let header = row(&["주문번호", "상품주문번호", "결제일시"]);
        let rows = vec![
            row(&["O-1", "'PO-1", "2024-01-02 10:00:00"]),
            row(&["O-2"]),
            row(&["O-3", "PO-3, with comma", "", "extra"]),
        ];

        store
            .write_all_rows("팩세이프_2024-01", &header, &rows)
            .await
            .expect("write");
        let read = store.read_all_rows("팩세이프_2024-01").await.expect("read");

        assert_eq!(read[0], header);
        assert_eq!(&read[1..], rows.as_slice());
    }

    #[tokio::test]
    async fn csv_store_reads_missing_table_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = CsvTableStore::new(dir.path());
        assert!(store.read_all_rows("nope").await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn csv_overwrite_drops_stale_trailing_rows() {
        let dir = tempdir().expect("tempdir");
        let store = CsvTableStore::new(dir.path());
        let header = row(&["A"]);
        store
            .write_all_rows("t", &header, &[row(&["1"]), row(&["2"]), row(&["3"])])
            .await
            .expect("first write");
        store
            .write_all_rows("t", &header, &[row(&["9"])])
            .await
            .expect("second write");

        let read = store.read_all_rows("t").await.expect("read");
        assert_eq!(read, vec![header, row(&["9"])]);
    }

    #[tokio::test]
    async fn csv_append_is_additive() {
        let dir = tempdir().expect("tempdir");
        let store = CsvTableStore::new(dir.path());
        store
            .write_all_rows("costs", &row(&["pid", "name"]), &[row(&["P1", "Cup"])])
            .await
            .expect("write");
        store
            .append_rows("costs", &[row(&["P2", "Lid"])])
            .await
            .expect("append");

        let read = store.read_all_rows("costs").await.expect("read");
        assert_eq!(read.len(), 3);
        assert_eq!(read[2], row(&["P2", "Lid"]));
    }

    #[tokio::test]
    async fn memory_store_rejects_writes_when_failing() {
        let store = MemoryTableStore::new();
        store.seed("t", vec![row(&["A"]), row(&["1"])]).await;
        store.set_fail_writes(true);

        let err = store
            .write_all_rows("t", &row(&["A"]), &[])
            .await
            .expect_err("write should fail");
        assert!(matches!(err, StorageError::WriteRejected(_)));
        assert_eq!(store.snapshot("t").await.len(), 2);
        assert_eq!(store.write_count("t").await, 0);
    }

    #[test]
    fn content_hash_distinguishes_cell_boundaries() {
        let a = content_sha256(&row(&["ab", "c"]), &[]);
        let b = content_sha256(&row(&["a", "bc"]), &[]);
        assert_ne!(a, b);
        assert_eq!(a, content_sha256(&row(&["ab", "c"]), &[]));
    }

    #[test]
    fn default_backoff_retries_three_times_within_the_cap() {
        let policy = BackoffPolicy::default();
        let delays: Vec<Duration> = (0..policy.max_retries)
            .map(|attempt| policy.delay_before_retry(attempt))
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(1000),
            ]
        );
        assert!(policy.permits_retry(2, RetryDisposition::Retryable));
        assert!(!policy.permits_retry(3, RetryDisposition::Retryable));
        assert_eq!(policy.delay_before_retry(64), policy.max_delay);
    }

    #[test]
    fn expired_token_fails_fast_while_throttling_backs_off() {
        let policy = BackoffPolicy::default();
        let unauthorized = RetryDisposition::of_status(StatusCode::UNAUTHORIZED);
        assert_eq!(unauthorized, RetryDisposition::NonRetryable);
        assert!(!policy.permits_retry(0, unauthorized));
        assert!(FetchError::HttpStatus {
            status: 401,
            url: "https://api.example/product-orders/query".into(),
        }
        .is_auth_failure());

        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::BAD_GATEWAY,
        ] {
            assert!(policy.permits_retry(0, RetryDisposition::of_status(status)));
        }
        assert_eq!(
            RetryDisposition::of_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
