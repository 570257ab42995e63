//! Core library for Termshift. Wires authentication, input normalization,
//! the model call, response validation and scan recording into the HTTP
//! handlers.

mod config;
pub mod auth;
pub mod error;
pub mod input;
pub mod llm;
pub mod prompt;
pub mod recorder;
pub mod validate;

pub use config::{read_store_credentials, AppConfig, RecorderConfig};
pub use error::{ApiError, ErrorResponse};

use axum::body::Bytes;
use axum::extract::{
    multipart::{MultipartError, MultipartRejection},
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    DefaultBodyLimit, Multipart, State,
};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{
    Authenticator, CallerIdentity, HttpIdentityVerifier, IdentityVerifier, API_KEY_HEADER,
};
use crate::input::AnalyzeTextRequest;
use crate::llm::{CallKind, CompletionProvider, ModelError, OpenAiClient, PROVIDER};
use crate::prompt::ChatCompletionRequest;
use crate::recorder::{HttpScanStore, ScanRecorder, ScanStore};

pub const SERVICE_NAME: &str = "termshift";

/// Room allowed on top of the upload ceiling for multipart framing, so a file
/// right at the ceiling is still accepted.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Low,
    Med,
    High,
}

/// One flagged clause: a half-open character range into the analyzed text.
/// Offsets come from the model and are not checked against the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub label: String,
    pub severity: Severity,
    pub start: u64,
    pub end: u64,
    pub explanation: String,
}

/// Echoed from the model; `risk_count` need not equal the number of spans.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub risk_count: u64,
    pub highest_severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub summary: AnalysisSummary,
    pub spans: Vec<Span>,
    pub model: ModelInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Analyze,
    AnalyzeFile,
    AnalyzeRaw,
    AnalyzeSummary,
}

impl Route {
    const ALL: [Route; 4] = [
        Route::Analyze,
        Route::AnalyzeFile,
        Route::AnalyzeRaw,
        Route::AnalyzeSummary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Route::Analyze => "analyze",
            Route::AnalyzeFile => "analyze_file",
            Route::AnalyzeRaw => "analyze_raw",
            Route::AnalyzeSummary => "analyze_summary",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Process-wide counters exposed on `/metrics`.
pub struct Metrics {
    pub requests_total: [AtomicU64; 4],
    pub unauthorized_total: AtomicU64,
    pub payload_too_large_total: AtomicU64,
    pub degraded_total: AtomicU64,
    pub model_failures_total: AtomicU64,
    pub scans_recorded_total: AtomicU64,
    // Model call latency histogram; counts aligned with `hist_buckets`.
    pub hist_buckets: Vec<u64>,
    pub hist_counts: Vec<AtomicU64>,
    pub hist_sum_ms: AtomicU64,
    pub hist_count: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        // Upper bounds in ms; model calls run from hundreds of ms to the 60s ceiling.
        let buckets: Vec<u64> = vec![250, 500, 1000, 2000, 5000, 10_000, 20_000, 30_000, 60_000];
        Self {
            requests_total: Default::default(),
            unauthorized_total: AtomicU64::new(0),
            payload_too_large_total: AtomicU64::new(0),
            degraded_total: AtomicU64::new(0),
            model_failures_total: AtomicU64::new(0),
            scans_recorded_total: AtomicU64::new(0),
            hist_counts: buckets.iter().map(|_| AtomicU64::new(0)).collect(),
            hist_buckets: buckets,
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
        }
    }
}

impl Metrics {
    fn observe_request(&self, route: Route) {
        self.requests_total[route.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn observe_error(&self, err: &ApiError) {
        match err {
            ApiError::Unauthorized(_) => {
                self.unauthorized_total.fetch_add(1, Ordering::Relaxed);
            }
            ApiError::PayloadTooLarge(_) => {
                self.payload_too_large_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn observe_model_latency(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.hist_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
        // find first bucket >= value
        for (idx, ub) in self.hist_buckets.iter().enumerate() {
            if ms <= *ub {
                self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }
}

/// Application state shared across handlers. Collaborators are built once
/// at startup and are read-only afterwards.
#[derive(Clone)]
pub struct AppState {
    pub authenticator: Authenticator,
    pub model: Arc<dyn CompletionProvider>,
    pub recorder: ScanRecorder,
    /// Ceiling for uploaded files and raw bodies, in bytes.
    pub max_upload_bytes: usize,
    pub cors_origins: Vec<String>,
    pub metrics: Arc<Metrics>,
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

impl AppState {
    pub fn from_config(config: AppConfig) -> Self {
        let AppConfig {
            shared_secret,
            model_api_key,
            model_id,
            model_base_url,
            identity_api_key,
            identity_lookup_url,
            store_credentials,
            max_upload_bytes,
            recorder,
            cors_origins,
        } = config;

        if model_api_key.is_none() {
            tracing::warn!("OPENAI_API_KEY not set; analysis requests will fail with a configuration error");
        }

        let verifier = identity_api_key.map(|key| {
            Arc::new(HttpIdentityVerifier::new(identity_lookup_url, key)) as Arc<dyn IdentityVerifier>
        });
        match (&shared_secret, &verifier) {
            (None, None) => tracing::warn!("neither API_TOKEN nor IDENTITY_API_KEY set; every request will be rejected"),
            (_, None) => tracing::info!("IDENTITY_API_KEY not set; only the shared secret is accepted"),
            _ => {}
        }

        let store = store_credentials
            .map(|creds| {
                Arc::new(
                    HttpScanStore::new(creds)
                        .with_request_timeout(Duration::from_millis(recorder.write_timeout_ms)),
                ) as Arc<dyn ScanStore>
            });
        if store.is_none() {
            tracing::info!("scan recording disabled: no scan store configured");
        }

        let start_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();

        Self {
            authenticator: Authenticator::new(shared_secret, verifier),
            model: Arc::new(OpenAiClient::new(model_api_key, model_id, &model_base_url)),
            recorder: ScanRecorder::new(
                store,
                recorder.max_inflight,
                Duration::from_millis(recorder.write_timeout_ms),
            ),
            max_upload_bytes,
            cors_origins,
            metrics: Arc::new(Metrics::default()),
            process_start_epoch: start_time.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }

    pub fn with_model(mut self, model: Arc<dyn CompletionProvider>) -> Self {
        self.model = model;
        self
    }

    pub fn with_identity_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.authenticator.set_verifier(verifier);
        self
    }

    pub fn with_scan_store(mut self, store: Arc<dyn ScanStore>) -> Self {
        self.recorder = self.recorder.with_store(store);
        self
    }
}

/// Build state from environment variables. See [`AppConfig::from_env`] for
/// the variables read.
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    Ok(AppState::from_config(config))
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let body_limit = state
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let cors = cors_layer(&state.cors_origins);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/analyze", post(analyze_handler))
        .route("/v1/analyze-file", post(analyze_file_handler))
        .route("/v1/analyze-raw", post(analyze_raw_handler))
        .route("/v1/analyze-summary", post(analyze_summary_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(API_KEY_HEADER),
        ])
}

fn respond<T: Serialize>(state: &AppState, result: Result<T, ApiError>) -> axum::response::Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => {
            state.metrics.observe_error(&err);
            err.into_response()
        }
    }
}

fn json_rejection_error(rejection: JsonRejection) -> ApiError {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => ApiError::PayloadTooLarge("Request body too large".into()),
        other => ApiError::InvalidRequest(other.body_text()),
    }
}

fn bytes_rejection_error(rejection: BytesRejection) -> ApiError {
    match rejection {
        BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_)) => {
            ApiError::PayloadTooLarge("Body too large for direct upload".into())
        }
        other => ApiError::InvalidRequest(other.body_text()),
    }
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge("File too large for direct upload".into())
    } else {
        ApiError::InvalidRequest(err.body_text())
    }
}

async fn call_model(
    state: &AppState,
    payload: &ChatCompletionRequest,
    kind: CallKind,
) -> Result<String, ApiError> {
    let start = Instant::now();
    let result = state.model.complete(payload, kind).await;
    match &result {
        Err(ModelError::NotConfigured) => {}
        Err(err) => {
            state
                .metrics
                .model_failures_total
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %err, kind = ?kind, "model call failed");
            state.metrics.observe_model_latency(start.elapsed());
        }
        Ok(_) => {
            let elapsed = start.elapsed();
            tracing::debug!(kind = ?kind, elapsed_ms = elapsed.as_millis() as u64, "model call completed");
            state.metrics.observe_model_latency(elapsed);
        }
    }
    result.map_err(ApiError::from)
}

/// Full analysis shared by the three span-producing routes.
async fn run_full_analysis(
    state: &AppState,
    caller: &CallerIdentity,
    text: &str,
    max_labels: u32,
) -> Result<AnalysisResult, ApiError> {
    let payload = prompt::full_analysis_payload(state.model.model_id(), text, max_labels);
    let raw = call_model(state, &payload, CallKind::Full).await?;

    let outcome = validate::parse_analysis(&raw);
    if let Some(reason) = outcome.degrade_reason() {
        tracing::warn!(reason = %reason, "bad JSON from model; returning empty analysis");
        state.metrics.degraded_total.fetch_add(1, Ordering::Relaxed);
    }
    let body = outcome.into_value();

    let scan_id = state
        .recorder
        .record(caller, text, &body.summary, &body.spans)
        .await;
    if scan_id.is_some() {
        state
            .metrics
            .scans_recorded_total
            .fetch_add(1, Ordering::Relaxed);
    }

    Ok(AnalysisResult {
        summary: body.summary,
        spans: body.spans,
        model: ModelInfo {
            provider: PROVIDER.to_string(),
            id: state.model.model_id().to_string(),
        },
        scan_id,
    })
}

async fn analyze_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<AnalyzeTextRequest>, JsonRejection>,
) -> axum::response::Response {
    state.metrics.observe_request(Route::Analyze);
    let result = async {
        let caller = state.authenticator.authenticate(&headers).await?;
        let Json(req) = payload.map_err(json_rejection_error)?;
        let max_labels = req.max_labels()?;
        run_full_analysis(&state, &caller, &req.text, max_labels).await
    }
    .await;
    respond(&state, result)
}

async fn analyze_file_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> axum::response::Response {
    state.metrics.observe_request(Route::AnalyzeFile);
    let result = async {
        let caller = state.authenticator.authenticate(&headers).await?;
        let mut multipart =
            multipart.map_err(|rejection| ApiError::InvalidRequest(rejection.body_text()))?;
        let mut blob: Option<Bytes> = None;
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            if field.name() == Some("file") || field.file_name().is_some() {
                blob = Some(field.bytes().await.map_err(multipart_error)?);
                break;
            }
        }
        let blob = blob.ok_or_else(|| ApiError::InvalidRequest("missing multipart field 'file'".into()))?;
        let text = input::normalize_blob(&blob, state.max_upload_bytes, "File")?;
        run_full_analysis(&state, &caller, &text, input::DEFAULT_MAX_LABELS).await
    }
    .await;
    respond(&state, result)
}

async fn analyze_raw_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> axum::response::Response {
    state.metrics.observe_request(Route::AnalyzeRaw);
    let result = async {
        let caller = state.authenticator.authenticate(&headers).await?;
        let body = body.map_err(bytes_rejection_error)?;
        let text = input::normalize_blob(&body, state.max_upload_bytes, "Body")?;
        run_full_analysis(&state, &caller, &text, input::DEFAULT_MAX_LABELS).await
    }
    .await;
    respond(&state, result)
}

async fn analyze_summary_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<AnalyzeTextRequest>, JsonRejection>,
) -> axum::response::Response {
    state.metrics.observe_request(Route::AnalyzeSummary);
    let result = async {
        state.authenticator.authenticate(&headers).await?;
        let Json(req) = payload.map_err(json_rejection_error)?;
        // Validated for compatibility with /v1/analyze; the summary prompt has no span cap.
        req.max_labels()?;
        let payload = prompt::fast_summary_payload(state.model.model_id(), &req.text);
        let raw = call_model(&state, &payload, CallKind::Fast).await?;
        let outcome = validate::parse_summary(&raw);
        if let Some(reason) = outcome.degrade_reason() {
            tracing::warn!(reason = %reason, "bad JSON from model; returning empty summary");
            state.metrics.degraded_total.fetch_add(1, Ordering::Relaxed);
        }
        Ok::<_, ApiError>(outcome.into_value())
    }
    .await;
    respond(&state, result)
}

/// Liveness endpoint.
async fn health_handler() -> axum::response::Response {
    let json = serde_json::json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition. Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    use std::fmt::Write as _;
    let m = &state.metrics;
    let mut buf = String::new();

    writeln!(
        &mut buf,
        "# HELP termshift_requests_total Analyze requests received per route\n# TYPE termshift_requests_total counter"
    )
    .ok();
    for route in Route::ALL {
        writeln!(
            &mut buf,
            "termshift_requests_total{{route=\"{}\"}} {}",
            route.as_str(),
            m.requests_total[route.index()].load(Ordering::Relaxed)
        )
        .ok();
    }

    let counters: [(&str, &str, &AtomicU64); 5] = [
        (
            "termshift_unauthorized_total",
            "Requests rejected for missing or invalid credentials",
            &m.unauthorized_total,
        ),
        (
            "termshift_payload_too_large_total",
            "Requests rejected for exceeding the upload ceiling",
            &m.payload_too_large_total,
        ),
        (
            "termshift_degraded_total",
            "Model responses that failed validation and were replaced by the empty result",
            &m.degraded_total,
        ),
        (
            "termshift_model_failures_total",
            "Model calls that failed with a transport error or non-success status",
            &m.model_failures_total,
        ),
        (
            "termshift_scans_recorded_total",
            "Scan records persisted to the document store",
            &m.scans_recorded_total,
        ),
    ];
    for (name, help, value) in counters {
        writeln!(&mut buf, "# HELP {} {}\n# TYPE {} counter", name, help, name).ok();
        writeln!(&mut buf, "{} {}", name, value.load(Ordering::Relaxed)).ok();
    }

    writeln!(
        &mut buf,
        "# HELP termshift_model_latency_ms Model call latency histogram milliseconds\n# TYPE termshift_model_latency_ms histogram"
    )
    .ok();
    let mut cumulative: u64 = 0;
    for (i, ub) in m.hist_buckets.iter().enumerate() {
        cumulative += m.hist_counts[i].load(Ordering::Relaxed);
        writeln!(
            &mut buf,
            "termshift_model_latency_ms_bucket{{le=\"{}\"}} {}",
            ub, cumulative
        )
        .ok();
    }
    let count = m.hist_count.load(Ordering::Relaxed);
    writeln!(
        &mut buf,
        "termshift_model_latency_ms_bucket{{le=\"+Inf\"}} {}",
        count
    )
    .ok();
    writeln!(
        &mut buf,
        "termshift_model_latency_ms_sum {}",
        m.hist_sum_ms.load(Ordering::Relaxed)
    )
    .ok();
    writeln!(&mut buf, "termshift_model_latency_ms_count {}", count).ok();

    writeln!(
        &mut buf,
        "# HELP termshift_build_info Build information\n# TYPE termshift_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "termshift_build_info{{version=\"{}\",model=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION"),
        state.model.model_id()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP termshift_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE termshift_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "termshift_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP termshift_process_uptime_seconds Process uptime seconds\n# TYPE termshift_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "termshift_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
