//! Outbound chat completion client.

use std::time::Duration;

use serde::Deserialize;

use crate::prompt::ChatCompletionRequest;

pub const PROVIDER: &str = "openai";
pub const DEFAULT_MODEL_ID: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Characters of an upstream error body kept for the server log.
const LOG_BODY_CHARS: usize = 200;

/// Which call is being made; selects the wall-clock ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Full,
    Fast,
}

impl CallKind {
    /// Default wall-clock ceiling for this kind of call.
    pub fn timeout(self) -> Duration {
        match self {
            CallKind::Full => Duration::from_secs(60),
            CallKind::Fast => Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model provider credential not configured")]
    NotConfigured,
    #[error("model provider returned status {status}")]
    Status { status: u16, body_preview: String },
    #[error("model provider transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("model provider response missing message content: {0}")]
    Envelope(String),
}

/// A single-shot completion backend. Implementations return the raw text of
/// the first choice's message.
#[async_trait::async_trait]
pub trait CompletionProvider: Send + Sync {
    fn model_id(&self) -> &str;
    async fn complete(
        &self,
        payload: &ChatCompletionRequest,
        kind: CallKind,
    ) -> Result<String, ModelError>;
}

#[derive(Deserialize)]
struct CompletionEnvelope {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<Message>,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

pub struct OpenAiClient {
    api_key: Option<String>,
    model_id: String,
    endpoint: String,
    full_timeout: Duration,
    fast_timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: Option<String>, model_id: impl Into<String>, base_url: &str) -> Self {
        Self {
            api_key,
            model_id: model_id.into(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            full_timeout: CallKind::Full.timeout(),
            fast_timeout: CallKind::Fast.timeout(),
            client: reqwest::Client::new(),
        }
    }

    /// Override the per-kind ceilings.
    pub fn with_timeouts(mut self, full: Duration, fast: Duration) -> Self {
        self.full_timeout = full;
        self.fast_timeout = fast;
        self
    }

    pub fn timeout_for(&self, kind: CallKind) -> Duration {
        match kind {
            CallKind::Full => self.full_timeout,
            CallKind::Fast => self.fast_timeout,
        }
    }
}

#[async_trait::async_trait]
impl CompletionProvider for OpenAiClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete(
        &self,
        payload: &ChatCompletionRequest,
        kind: CallKind,
    ) -> Result<String, ModelError> {
        let api_key = self.api_key.as_deref().ok_or(ModelError::NotConfigured)?;
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .timeout(self.timeout_for(kind))
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, timeout = err.is_timeout(), "model call transport error");
                ModelError::Transport(err)
            })?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            let body_preview: String = text.chars().take(LOG_BODY_CHARS).collect();
            tracing::warn!(status = status.as_u16(), body = %body_preview, "model call returned error status");
            return Err(ModelError::Status {
                status: status.as_u16(),
                body_preview,
            });
        }
        extract_content(&text)
    }
}

/// Unpack `choices[0].message.content` from a completion response body.
pub fn extract_content(body: &str) -> Result<String, ModelError> {
    let envelope: CompletionEnvelope = serde_json::from_str(body).map_err(|err| {
        tracing::warn!(error = %err, "model response is not a completion envelope");
        ModelError::Envelope(err.to_string())
    })?;
    envelope
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .ok_or_else(|| {
            tracing::warn!("model response has no choices[0].message.content");
            ModelError::Envelope("no message content".into())
        })
}
