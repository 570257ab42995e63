use std::env;
use std::fs;

use anyhow::{anyhow, Context, Result};

use crate::input::MAX_UPLOAD_BYTES;
use crate::llm::{DEFAULT_BASE_URL, DEFAULT_MODEL_ID};
use crate::recorder::{StoreCredentials, DEFAULT_MAX_INFLIGHT, DEFAULT_WRITE_TIMEOUT_MS};

pub const DEFAULT_IDENTITY_LOOKUP_URL: &str =
    "https://identitytoolkit.googleapis.com/v1/accounts:lookup";

pub const DEFAULT_CORS_ORIGINS: [&str; 3] = [
    "http://localhost:5173",
    "http://127.0.0.1:5173",
    "https://app.gertly.com",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    pub max_inflight: usize,
    pub write_timeout_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_inflight: DEFAULT_MAX_INFLIGHT,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Static token accepted as-is (`API_TOKEN`).
    pub shared_secret: Option<String>,
    pub model_api_key: Option<String>,
    pub model_id: String,
    pub model_base_url: String,
    /// Enables delegated token verification when set.
    pub identity_api_key: Option<String>,
    pub identity_lookup_url: String,
    /// Store connection material; `None` disables scan recording.
    pub store_credentials: Option<StoreCredentials>,
    pub max_upload_bytes: usize,
    pub recorder: RecorderConfig,
    pub cors_origins: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            model_api_key: None,
            model_id: DEFAULT_MODEL_ID.to_string(),
            model_base_url: DEFAULT_BASE_URL.to_string(),
            identity_api_key: None,
            identity_lookup_url: DEFAULT_IDENTITY_LOOKUP_URL.to_string(),
            store_credentials: None,
            max_upload_bytes: MAX_UPLOAD_BYTES,
            recorder: RecorderConfig::default(),
            cors_origins: DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let recorder = RecorderConfig {
            max_inflight: parse_optional_u64("TERMSHIFT_RECORDER_MAX_INFLIGHT")?
                .map(|v| v as usize)
                .unwrap_or(defaults.recorder.max_inflight),
            write_timeout_ms: parse_optional_u64("TERMSHIFT_RECORDER_TIMEOUT_MS")?
                .unwrap_or(defaults.recorder.write_timeout_ms),
        };

        let cors_origins = non_empty_var("TERMSHIFT_CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|origins| !origins.is_empty())
            .unwrap_or(defaults.cors_origins);

        Ok(Self {
            shared_secret: non_empty_var("API_TOKEN"),
            model_api_key: non_empty_var("OPENAI_API_KEY"),
            model_id: non_empty_var("MODEL_ID").unwrap_or(defaults.model_id),
            model_base_url: non_empty_var("OPENAI_BASE_URL").unwrap_or(defaults.model_base_url),
            identity_api_key: non_empty_var("IDENTITY_API_KEY"),
            identity_lookup_url: non_empty_var("IDENTITY_LOOKUP_URL")
                .unwrap_or(defaults.identity_lookup_url),
            store_credentials: load_store_credentials(),
            max_upload_bytes: parse_optional_u64("TERMSHIFT_MAX_UPLOAD_BYTES")?
                .map(|v| v as usize)
                .unwrap_or(defaults.max_upload_bytes),
            recorder,
            cors_origins,
        })
    }
}

/// A store that cannot be initialised leaves recording disabled; the
/// service still starts.
fn load_store_credentials() -> Option<StoreCredentials> {
    let path = non_empty_var("SCAN_STORE_CREDENTIALS")?;
    match read_store_credentials(&path) {
        Ok(creds) => Some(creds),
        Err(err) => {
            tracing::warn!(path = %path, error = %format!("{:#}", err), "scan store unavailable; scans will not be recorded");
            None
        }
    }
}

pub fn read_store_credentials(path: &str) -> Result<StoreCredentials> {
    let content = fs::read_to_string(path).with_context(|| {
        format!(
            "Failed to read SCAN_STORE_CREDENTIALS '{}': file unreadable",
            path
        )
    })?;
    serde_json::from_str::<StoreCredentials>(&content).with_context(|| {
        format!(
            "Failed to parse SCAN_STORE_CREDENTIALS '{}': invalid JSON credentials",
            path
        )
    })
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|v| *v > 0)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
