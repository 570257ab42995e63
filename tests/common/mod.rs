#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use termshift::auth::{IdentityVerifier, VerifyError};
use termshift::recorder::{ScanRecord, ScanStore, StoreError};
use termshift::AppConfig;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceExt;

pub const TOKEN: &str = "test-token";
pub const MODEL_KEY: &str = "sk-test";
pub const UPSTREAM_ERROR_TEXT: &str = "upstream exploded: quota exhausted for org-123";

pub const HELLO_WORLD_REPLY: &str = r#"{"summary":{"risk_count":1,"highest_severity":"HIGH"},"spans":[{"label":"Arbitration","severity":"HIGH","start":0,"end":20,"explanation":"Sample"}]}"#;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        self.originals
            .entry(key.to_string())
            .or_insert_with(|| std::env::var(key).ok());
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Address nothing listens on: bound, read, then released.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn serve(router: Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, handle)
}

#[derive(Clone)]
struct MockModelState {
    status: StatusCode,
    content: String,
    delay: Duration,
    hits: Arc<AtomicUsize>,
    last_body: Arc<Mutex<Option<Value>>>,
    last_auth: Arc<Mutex<Option<String>>>,
}

/// A chat-completion endpoint that answers every call with the same message
/// content (or, for non-2xx statuses, with [`UPSTREAM_ERROR_TEXT`]).
pub struct MockModel {
    pub base_url: String,
    state: MockModelState,
    _handle: JoinHandle<()>,
}

impl MockModel {
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn last_body(&self) -> Value {
        self.state
            .last_body
            .lock()
            .unwrap()
            .clone()
            .expect("model was never called")
    }

    pub fn last_auth(&self) -> Option<String> {
        self.state.last_auth.lock().unwrap().clone()
    }

    /// Text of the user message in the last request.
    pub fn last_user_text(&self) -> String {
        self.last_body()["messages"][1]["content"]
            .as_str()
            .unwrap()
            .to_string()
    }
}

async fn mock_completion(
    State(mock): State<MockModelState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    mock.hits.fetch_add(1, Ordering::SeqCst);
    *mock.last_body.lock().unwrap() = Some(body);
    *mock.last_auth.lock().unwrap() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    tokio::time::sleep(mock.delay).await;
    if !mock.status.is_success() {
        return (mock.status, UPSTREAM_ERROR_TEXT).into_response();
    }
    Json(json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": mock.content},
            "finish_reason": "stop"
        }]
    }))
    .into_response()
}

pub async fn spawn_mock_model(status: StatusCode, content: &str) -> MockModel {
    spawn_delayed_model(status, content, Duration::ZERO).await
}

/// Like [`spawn_mock_model`], but every answer is held back by `delay`.
pub async fn spawn_delayed_model(status: StatusCode, content: &str, delay: Duration) -> MockModel {
    let state = MockModelState {
        status,
        content: content.to_string(),
        delay,
        hits: Arc::new(AtomicUsize::new(0)),
        last_body: Arc::new(Mutex::new(None)),
        last_auth: Arc::new(Mutex::new(None)),
    };
    let router = Router::new()
        .route("/v1/chat/completions", post(mock_completion))
        .with_state(state.clone());
    let (addr, handle) = serve(router).await;
    MockModel {
        base_url: format!("http://{}/v1", addr),
        state,
        _handle: handle,
    }
}

/// Shared-secret auth plus a provider key pointing at `model_base_url`.
pub fn test_config(model_base_url: &str) -> AppConfig {
    AppConfig {
        shared_secret: Some(TOKEN.to_string()),
        model_api_key: Some(MODEL_KEY.to_string()),
        model_base_url: model_base_url.to_string(),
        ..AppConfig::default()
    }
}

/// Identity verifier that resolves every token to a fixed uid, or refuses
/// them all, and counts its calls.
pub struct CountingVerifier {
    pub calls: AtomicUsize,
    uid: Option<String>,
}

impl CountingVerifier {
    pub fn accepting(uid: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            uid: Some(uid.to_string()),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            uid: None,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl IdentityVerifier for CountingVerifier {
    async fn verify(&self, _token: &str) -> Result<String, VerifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.uid.clone().ok_or(VerifyError::MissingSubject)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub records: Mutex<Vec<(String, ScanRecord)>>,
}

#[async_trait::async_trait]
impl ScanStore for MemoryStore {
    async fn append(&self, uid: &str, record: &ScanRecord) -> Result<String, StoreError> {
        let mut guard = self.records.lock().unwrap();
        guard.push((uid.to_string(), record.clone()));
        Ok(format!("scan-{}", guard.len()))
    }
}

pub fn json_request(uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(tok) = token {
        builder = builder.header("authorization", format!("Bearer {}", tok));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn raw_request(uri: &str, token: Option<&str>, body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "text/plain");
    if let Some(tok) = token {
        builder = builder.header("authorization", format!("Bearer {}", tok));
    }
    builder.body(Body::from(body)).unwrap()
}

pub const BOUNDARY: &str = "termshift-test-boundary";

/// Multipart body with one `file` part.
pub fn multipart_request(uri: &str, token: Option<&str>, filename: &str, content: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: text/plain\r\n\r\n",
            filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        );
    if let Some(tok) = token {
        builder = builder.header("authorization", format!("Bearer {}", tok));
    }
    builder.body(Body::from(body)).unwrap()
}

/// Drive one request through the router and return status plus raw body.
pub async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

pub async fn send_json(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, text) = send(app, request).await;
    let value = serde_json::from_str(&text).unwrap_or(Value::Null);
    (status, value)
}

pub async fn spawn_lookup_service(valid_token: &'static str, uid: &'static str) -> (String, JoinHandle<()>) {
    async fn lookup(
        State((valid, uid)): State<(&'static str, &'static str)>,
        Json(body): Json<Value>,
    ) -> Response {
        if body.get("idToken").and_then(|v| v.as_str()) == Some(valid) {
            Json(json!({"kind": "identitytoolkit#GetAccountInfoResponse", "users": [{"localId": uid}]}))
                .into_response()
        } else {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"code": 400, "message": "INVALID_ID_TOKEN"}})),
            )
                .into_response()
        }
    }
    let router = Router::new()
        .route("/v1/accounts:lookup", post(lookup))
        .with_state((valid_token, uid));
    let (addr, handle) = serve(router).await;
    (format!("http://{}/v1/accounts:lookup", addr), handle)
}

/// Document store that appends into memory and answers with a resource path.
pub async fn spawn_store_service() -> (String, Arc<Mutex<Vec<(String, Value, Option<String>)>>>, JoinHandle<()>) {
    type Seen = Arc<Mutex<Vec<(String, Value, Option<String>)>>>;
    async fn append(
        State(seen): State<Seen>,
        Path(uid): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let mut guard = seen.lock().unwrap();
        guard.push((uid.clone(), body, auth));
        Json(json!({"name": format!("projects/p/databases/(default)/documents/users/{}/scans/doc{}", uid, guard.len())}))
    }
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let router = Router::new()
        .route("/users/:uid/scans", post(append))
        .with_state(seen.clone());
    let (addr, handle) = serve(router).await;
    (format!("http://{}", addr), seen, handle)
}
