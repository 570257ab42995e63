//! Caller authentication.
//!
//! A request carries at most one credential, either as a bearer token or in
//! the `x-api-key` header. The credential is accepted when it matches the
//! configured shared secret, otherwise it is handed to a delegated identity
//! verifier which resolves it to a user id.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use serde::Deserialize;

/// Uid reported for callers authenticated with the shared secret. Whether a
/// scan is recorded follows [`CallerKind`], not this value.
pub const SHARED_SECRET_UID: &str = "shared-secret";

pub const API_KEY_HEADER: &str = "x-api-key";

const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// How a caller proved who they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerKind {
    SharedSecret,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub uid: String,
    pub kind: CallerKind,
}

impl CallerIdentity {
    pub fn shared_secret() -> Self {
        Self {
            uid: SHARED_SECRET_UID.to_string(),
            kind: CallerKind::SharedSecret,
        }
    }

    /// A caller resolved by the identity verifier to `uid`.
    pub fn user(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            kind: CallerKind::User,
        }
    }

    pub fn is_shared_secret(&self) -> bool {
        self.kind == CallerKind::SharedSecret
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Unauthorized: missing credential")]
    MissingCredential,
    #[error("Unauthorized: invalid or expired token")]
    InvalidToken,
}

/// Reasons a delegated token was refused. These stay server-side; callers
/// only ever see [`AuthError::InvalidToken`].
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("identity provider rejected token (status {0})")]
    Rejected(u16),
    #[error("identity provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("identity provider response carried no subject")]
    MissingSubject,
}

#[async_trait::async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolve a caller-supplied token to the provider's subject id.
    async fn verify(&self, token: &str) -> Result<String, VerifyError>;
}

/// Verifies tokens against an account lookup endpoint that accepts
/// `{"idToken": ...}` and answers `{"users": [{"localId": ...}]}`.
pub struct HttpIdentityVerifier {
    lookup_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: Option<String>,
}

impl HttpIdentityVerifier {
    pub fn new(lookup_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            lookup_url: lookup_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<String, VerifyError> {
        let resp = self
            .client
            .post(&self.lookup_url)
            .query(&[("key", self.api_key.as_str())])
            .timeout(VERIFY_TIMEOUT)
            .json(&serde_json::json!({ "idToken": token }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(VerifyError::Rejected(status.as_u16()));
        }
        let body: LookupResponse = resp.json().await?;
        body.users
            .into_iter()
            .next()
            .and_then(|u| u.local_id)
            .filter(|uid| !uid.is_empty())
            .ok_or(VerifyError::MissingSubject)
    }
}

#[derive(Clone)]
pub struct Authenticator {
    shared_secret: Option<String>,
    verifier: Option<Arc<dyn IdentityVerifier>>,
}

impl Authenticator {
    pub fn new(shared_secret: Option<String>, verifier: Option<Arc<dyn IdentityVerifier>>) -> Self {
        Self {
            shared_secret,
            verifier,
        }
    }

    pub fn set_verifier(&mut self, verifier: Arc<dyn IdentityVerifier>) {
        self.verifier = Some(verifier);
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<CallerIdentity, AuthError> {
        let token = extract_token(headers);
        if let (Some(secret), Some(tok)) = (self.shared_secret.as_deref(), token.as_deref()) {
            if tok == secret {
                return Ok(CallerIdentity::shared_secret());
            }
        }
        let token = token.ok_or(AuthError::MissingCredential)?;
        let Some(verifier) = self.verifier.as_ref() else {
            tracing::debug!("no identity verifier configured; rejecting non-secret token");
            return Err(AuthError::InvalidToken);
        };
        match verifier.verify(&token).await {
            Ok(uid) => Ok(CallerIdentity::user(uid)),
            Err(err) => {
                tracing::debug!(error = %err, "identity token verification failed");
                Err(AuthError::InvalidToken)
            }
        }
    }
}

/// Pull the single credential out of the request headers. A bearer
/// `Authorization` header wins over `x-api-key`.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| {
            if raw.len() < 7 || !raw[..7].eq_ignore_ascii_case("bearer ") {
                return None;
            }
            let token = raw[7..].trim();
            (!token.is_empty()).then(|| token.to_string())
        });
    bearer.or_else(|| {
        headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    })
}
