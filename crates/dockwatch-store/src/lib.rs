//! Snapshot persistence + HTTP fetch utilities for Dockwatch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dockwatch_core::Listing;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dockwatch-store";

/// Read/write failure on persisted snapshot state. Always aborts the cycle
/// that hit it; there is no degraded mode for a broken store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("decoding {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("encoding snapshot for {source_key}: {source}")]
    Encode {
        source_key: String,
        source: serde_json::Error,
    },
}

/// On-disk snapshot envelope: the listings plus the moment they were
/// persisted, which the dashboard surfaces as "last updated".
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    saved_at: DateTime<Utc>,
    listings: Vec<Listing>,
}

/// File-backed snapshot store, one JSON document per source key.
///
/// Saves are full replacements written via temp-file-then-rename, so a
/// concurrent reader never observes a partially written snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self, source_key: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_source_key(source_key)))
    }

    /// Load the last persisted snapshot, or None when the source has never
    /// been crawled. A missing file is not an error.
    pub async fn load(&self, source_key: &str) -> Result<Option<Vec<Listing>>, StoreError> {
        Ok(self.load_envelope(source_key).await?.map(|s| s.listings))
    }

    /// Timestamp of the last successful save for a source, if any.
    pub async fn last_updated(
        &self,
        source_key: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.load_envelope(source_key).await?.map(|s| s.saved_at))
    }

    async fn load_envelope(&self, source_key: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        let path = self.snapshot_path(source_key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Read { path, source: err }),
        };
        let snapshot = serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::Decode { path, source: err })?;
        Ok(Some(snapshot))
    }

    /// Persist a snapshot as a full replacement of whatever was stored
    /// before. Never merges, never appends.
    pub async fn save(&self, source_key: &str, listings: &[Listing]) -> Result<(), StoreError> {
        let path = self.snapshot_path(source_key);
        let envelope = StoredSnapshot {
            saved_at: Utc::now(),
            listings: listings.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope).map_err(|err| StoreError::Encode {
            source_key: source_key.to_string(),
            source: err,
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|err| StoreError::Write {
                path: parent.to_path_buf(),
                source: err,
            })?;
        }

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Write { path, source: err });
        }
        Ok(())
    }

    /// Source keys with a persisted snapshot, sorted for stable listing.
    pub async fn known_sources(&self) -> Result<Vec<String>, StoreError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StoreError::Read {
                    path: self.root.clone(),
                    source: err,
                })
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|err| StoreError::Read {
            path: self.root.clone(),
            source: err,
        })? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(key) = name.strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Filesystem-safe slug for a source key.
pub fn sanitize_source_key(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
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
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
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

impl FetchedResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Network/HTTP failure after the retry budget is spent.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared reqwest client with bounded concurrency and retry-with-backoff on
/// retryable failures. Page ordering and per-source sequencing are the
/// caller's concern; this type only bounds total in-flight requests.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        source_key: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.global_limit.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_key, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
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
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
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
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
