//! Durable snapshot/config persistence, debug page captures, and the HTTP
//! fetch helper used by upstream collectors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use radar_core::{MonitorConfig, Snapshot};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "radar-storage";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `bytes` to `target` via a sibling temp file and rename, so readers
/// only ever see the old or the new content.
pub async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(io_err(&parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(bytes).await.map_err(io_err(&temp_path))?;
    file.flush().await.map_err(io_err(&temp_path))?;
    file.sync_all().await.map_err(io_err(&temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(PersistenceError::Io {
            path: target.to_path_buf(),
            source: err,
        });
    }
    Ok(())
}

/// Sole durable source of the previous cycle's state.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing or unreadable file yields an empty snapshot.
    pub async fn load(&self) -> Snapshot {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Snapshot::empty(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "reading snapshot failed; starting empty");
                return Snapshot::empty();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "snapshot file is corrupt; starting empty");
                Snapshot::empty()
            }
        }
    }

    pub async fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(|source| PersistenceError::Serialize {
            what: "snapshot",
            source,
        })?;
        write_atomic(&self.path, &bytes).await
    }
}

/// JSON configuration file the operator edits while the process runs.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the default config if none exists. Returns true when a file was created.
    pub async fn ensure_default(&self) -> anyhow::Result<bool> {
        if fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking config path {}", self.path.display()))?
        {
            return Ok(false);
        }
        self.save(&MonitorConfig::default()).await?;
        Ok(true)
    }

    pub async fn load(&self) -> anyhow::Result<MonitorConfig> {
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    /// Reload, keeping `last_good` when the file is missing or malformed.
    pub async fn load_or(&self, last_good: &MonitorConfig) -> MonitorConfig {
        match self.load().await {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "config reload failed; keeping previous config");
                last_good.clone()
            }
        }
    }

    pub async fn save(&self, config: &MonitorConfig) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(config).context("serializing config")?;
        write_atomic(&self.path, &bytes)
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct StoredCapture {
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub latest_path: PathBuf,
    pub byte_size: usize,
}

/// Content-addressed store for page sources captured when extraction finds nothing.
#[derive(Debug, Clone)]
pub struct DebugArtifactStore {
    root: PathBuf,
}

impl DebugArtifactStore {
    pub const LATEST_PAGE: &'static str = "page_source.html";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn capture_relative_path(captured_at: DateTime<Utc>, content_hash: &str) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d_%H%M%S").to_string();
        let short = content_hash.get(..12).unwrap_or(content_hash);
        PathBuf::from("captures").join(format!("{stamp}_{short}.html"))
    }

    /// Store the page under a hashed name and refresh `page_source.html`.
    pub async fn store_page(
        &self,
        captured_at: DateTime<Utc>,
        html: &str,
    ) -> Result<StoredCapture, PersistenceError> {
        let bytes = html.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let absolute_path = self
            .root
            .join(Self::capture_relative_path(captured_at, &content_hash));
        let latest_path = self.root.join(Self::LATEST_PAGE);

        write_atomic(&absolute_path, bytes).await?;
        write_atomic(&latest_path, bytes).await?;

        Ok(StoredCapture {
            content_hash,
            absolute_path,
            latest_path,
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// GET with bounded, capped exponential retry on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
            backoff: config.backoff,
        })
    }

    pub async fn fetch_json_bytes(&self, source: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source, url);
        self.fetch_inner(url).instrument(span).await
    }

    async fn fetch_inner(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let resp_result = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retryable status; backing off");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "transport error; backing off");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
