//! Best-effort persistence of scan records.
//!
//! Writes go to a per-user `scans` collection in an external document store.
//! A write runs on its own task, gated by a semaphore, and is joined under a
//! timeout before the response is produced. A write that misses the deadline
//! is aborted, so no record lands without its id reaching the caller. Nothing
//! in here can fail a request: every error path ends in `None`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::auth::CallerIdentity;
use crate::input::{truncate_chars, PREVIEW_CHARS};
use crate::{AnalysisSummary, Span};

pub const DEFAULT_MAX_INFLIGHT: usize = 8;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScanRecord {
    pub uid: String,
    pub timestamp: String,
    pub text_preview: String,
    pub summary: AnalysisSummary,
    pub spans: Vec<Span>,
}

impl ScanRecord {
    pub fn new(uid: &str, text: &str, summary: &AnalysisSummary, spans: &[Span]) -> Self {
        Self {
            uid: uid.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            text_preview: truncate_chars(text, PREVIEW_CHARS).to_string(),
            summary: summary.clone(),
            spans: spans.to_vec(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("document store returned status {0}")]
    Status(u16),
    #[error("document store response carried no document id")]
    MissingId,
    #[error("document store base url unusable: {0}")]
    InvalidUrl(String),
}

#[async_trait::async_trait]
pub trait ScanStore: Send + Sync {
    /// Append `record` under `users/{uid}/scans` and return the new document id.
    async fn append(&self, uid: &str, record: &ScanRecord) -> Result<String, StoreError>;
}

/// Connection material for [`HttpScanStore`], loaded from a JSON file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreCredentials {
    pub base_url: String,
    pub token: String,
}

/// Document store reached over a REST API: `POST {base}/users/{uid}/scans`.
pub struct HttpScanStore {
    base_url: String,
    token: String,
    request_timeout: Duration,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CreatedDocument {
    id: Option<String>,
    name: Option<String>,
}

impl HttpScanStore {
    pub fn new(credentials: StoreCredentials) -> Self {
        Self {
            base_url: credentials.base_url.trim_end_matches('/').to_string(),
            token: credentials.token,
            request_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            client: reqwest::Client::new(),
        }
    }

    /// Per-request ceiling. Keep it at or below the recorder's write timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// `{base}/users/{uid}/scans`, with `uid` encoded as a single segment.
    pub fn scans_url(&self, uid: &str) -> Result<reqwest::Url, StoreError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|err| StoreError::InvalidUrl(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .push("users")
            .push(uid)
            .push("scans");
        Ok(url)
    }
}

#[async_trait::async_trait]
impl ScanStore for HttpScanStore {
    async fn append(&self, uid: &str, record: &ScanRecord) -> Result<String, StoreError> {
        let url = self.scans_url(uid)?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .timeout(self.request_timeout)
            .json(record)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::Status(status.as_u16()));
        }
        let doc: CreatedDocument = resp.json().await?;
        // Stores that return a resource path ("…/scans/<id>") instead of an id.
        doc.id
            .or_else(|| {
                doc.name
                    .as_deref()
                    .and_then(|n| n.rsplit('/').next())
                    .map(|s| s.to_string())
            })
            .filter(|id| !id.is_empty())
            .ok_or(StoreError::MissingId)
    }
}

#[derive(Clone)]
pub struct ScanRecorder {
    store: Option<Arc<dyn ScanStore>>,
    permits: Arc<Semaphore>,
    write_timeout: Duration,
}

impl ScanRecorder {
    pub fn new(store: Option<Arc<dyn ScanStore>>, max_inflight: usize, write_timeout: Duration) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(max_inflight.max(1))),
            write_timeout,
        }
    }

    pub fn disabled() -> Self {
        Self::new(
            None,
            DEFAULT_MAX_INFLIGHT,
            Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
        )
    }

    /// Same limits, different backing store.
    pub fn with_store(&self, store: Arc<dyn ScanStore>) -> Self {
        Self {
            store: Some(store),
            permits: self.permits.clone(),
            write_timeout: self.write_timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Persist a scan for `caller` and return its id, or `None` when the
    /// write is skipped or fails.
    pub async fn record(
        &self,
        caller: &CallerIdentity,
        text: &str,
        summary: &AnalysisSummary,
        spans: &[Span],
    ) -> Option<String> {
        let store = self.store.as_ref()?.clone();
        if caller.is_shared_secret() {
            return None;
        }
        let record = ScanRecord::new(&caller.uid, text, summary, spans);
        let uid = caller.uid.clone();
        let deadline = tokio::time::Instant::now() + self.write_timeout;

        let permit =
            match tokio::time::timeout_at(deadline, self.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return None,
                Err(_) => {
                    self.log_timeout();
                    return None;
                }
            };
        let mut task = tokio::spawn(async move {
            let _permit = permit;
            store.append(&uid, &record).await
        });

        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(Ok(id))) => Some(id),
            Ok(Ok(Err(err))) => {
                tracing::warn!(error = %err, "scan record write failed");
                None
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "scan record task aborted");
                None
            }
            Err(_) => {
                task.abort();
                self.log_timeout();
                None
            }
        }
    }

    fn log_timeout(&self) {
        tracing::warn!(
            timeout_ms = self.write_timeout.as_millis() as u64,
            "scan record write timed out"
        );
    }
}
