//! Credential production, renewal, and server clock offset.
//!
//! Exactly one [`AuthMechanism`] is configured per client. The coordinator
//! lives on the engine's execution context; the actual network fetches run in
//! spawned tasks and report back, so renewal never blocks the event loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::oneshot;

use crate::error::{BoxError, Error, ErrorInfo, error_code};
use crate::http::{HttpExecutor, HttpMethod, HttpRequest};
use crate::transport::PROTOCOL_VERSION;

/// Future returned by an auth callback.
pub type TokenSourceFuture = Pin<Box<dyn Future<Output = Result<TokenSource, BoxError>> + Send>>;

/// Callback that produces token material from application code.
pub type AuthCallback = Arc<dyn Fn(TokenParams) -> TokenSourceFuture + Send + Sync>;

/// Parameters for a token request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenParams {
    /// Requested token lifetime in milliseconds.
    pub ttl: Option<i64>,
    /// Capability JSON string.
    pub capability: Option<String>,
    pub client_id: Option<String>,
    /// Explicit timestamp (ms); when absent the offset-corrected local clock
    /// is used.
    pub timestamp: Option<i64>,
    pub nonce: Option<String>,
}

/// A signed token request, exchangeable for a [`TokenDetails`] at the REST
/// `requestToken` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub key_name: String,
    pub timestamp: i64,
    pub nonce: String,
    pub mac: String,
    pub capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// An issued credential. Replaced wholesale on each renewal, never mutated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    pub token: String,
    /// Expiry (ms since epoch); `0` means no known expiry.
    #[serde(default)]
    pub expires: i64,
    #[serde(default)]
    pub issued: i64,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl TokenDetails {
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        self.expires == 0 || now_ms < self.expires
    }
}

/// What an auth callback or auth URL may yield.
#[derive(Debug)]
pub enum TokenSource {
    Token(String),
    Details(TokenDetails),
    Request(TokenRequest),
}

/// The configured credential mechanism. Dynamic inputs (literal token,
/// structured details, signed request, callback, URL) resolve at this
/// boundary into one [`TokenDetails`] representation.
#[derive(Clone)]
pub enum AuthMechanism {
    /// A literal token string; no renewal means.
    Token(String),
    /// Pre-issued token details; no renewal means.
    Details(TokenDetails),
    /// An API key used to sign token requests locally.
    Key { name: String, secret: String },
    /// Application callback returning token material.
    Callback(AuthCallback),
    /// URL fetched for token material (plain-text token, JSON token details,
    /// or JSON token request).
    Url {
        url: String,
        method: HttpMethod,
        headers: Vec<(String, String)>,
    },
}

impl AuthMechanism {
    /// Parse an `name:secret` API key string.
    pub fn from_key(key: &str) -> Result<Self, ErrorInfo> {
        match key.split_once(':') {
            Some((name, secret)) if !name.is_empty() && !secret.is_empty() => {
                Ok(AuthMechanism::Key {
                    name: name.to_string(),
                    secret: secret.to_string(),
                })
            }
            _ => Err(ErrorInfo::new(
                error_code::BAD_REQUEST,
                "invalid key string, expected name:secret",
            )),
        }
    }

    /// Whether a fresh credential can be produced when the current one
    /// expires. A static token with no renewal means is terminal.
    pub fn is_renewable(&self) -> bool {
        !matches!(self, AuthMechanism::Token(_) | AuthMechanism::Details(_))
    }
}

impl std::fmt::Debug for AuthMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMechanism::Token(_) => f.write_str("AuthMechanism::Token"),
            AuthMechanism::Details(_) => f.write_str("AuthMechanism::Details"),
            AuthMechanism::Key { name, .. } => write!(f, "AuthMechanism::Key({name})"),
            AuthMechanism::Callback(_) => f.write_str("AuthMechanism::Callback"),
            AuthMechanism::Url { url, .. } => write!(f, "AuthMechanism::Url({url})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Token request signing
// ---------------------------------------------------------------------------

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Build and HMAC-SHA256-sign a token request from an API key.
///
/// The mac covers the canonicalized parameters, newline-terminated, in this
/// exact order: keyName, ttl, capability, clientId, timestamp, nonce.
pub fn sign_token_request(
    key_name: &str,
    key_secret: &str,
    params: &TokenParams,
    timestamp: i64,
    nonce: String,
) -> Result<TokenRequest, ErrorInfo> {
    let ttl = params.ttl;
    let capability = params.capability.clone().unwrap_or_default();
    let client_id = params.client_id.clone();

    let text = format!(
        "{key_name}\n{}\n{capability}\n{}\n{timestamp}\n{nonce}\n",
        ttl.map(|t| t.to_string()).unwrap_or_default(),
        client_id.as_deref().unwrap_or(""),
    );
    let mut mac = Hmac::<Sha256>::new_from_slice(key_secret.as_bytes())
        .map_err(|e| ErrorInfo::new(error_code::BAD_REQUEST, format!("invalid key secret: {e}")))?;
    mac.update(text.as_bytes());
    let mac = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    Ok(TokenRequest {
        key_name: key_name.to_string(),
        timestamp,
        nonce,
        mac,
        capability,
        ttl,
        client_id,
    })
}

// ---------------------------------------------------------------------------
// Token fetching (runs off the event loop)
// ---------------------------------------------------------------------------

/// Exchange a signed [`TokenRequest`] for a [`TokenDetails`] at the REST API.
pub(crate) async fn exchange_token(
    http: &dyn HttpExecutor,
    request: &TokenRequest,
    rest_base: &str,
) -> Result<TokenDetails, ErrorInfo> {
    let url = format!("{rest_base}/keys/{}/requestToken", request.key_name);
    let body = serde_json::to_vec(request).map_err(|e| {
        ErrorInfo::new(error_code::BAD_REQUEST, format!("token request encode: {e}"))
    })?;
    let mut req = HttpRequest::post_json(url, body);
    req.headers
        .push(("X-Ably-Version".to_string(), PROTOCOL_VERSION.to_string()));
    let resp = http.execute(req).await.map_err(Error::into_error_info)?;
    if !resp.is_success() {
        return Err(error_from_response(resp.status, &resp.body));
    }
    serde_json::from_slice(&resp.body).map_err(|e| {
        ErrorInfo::new(
            error_code::AUTH_CONFIGURED_PROVIDER_FAILURE,
            format!("token exchange returned malformed body: {e}"),
        )
    })
}

fn error_from_response(status: u16, body: &[u8]) -> ErrorInfo {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorInfo,
    }
    if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) {
        let mut info = parsed.error;
        info.status_code.get_or_insert(status as i32);
        return info;
    }
    ErrorInfo::with_status(
        error_code::AUTH_CONFIGURED_PROVIDER_FAILURE,
        status as i32,
        format!("token endpoint returned HTTP {status}"),
    )
}

/// Interpret an auth-URL response by content type: plain-text token, JSON
/// token details, or JSON token request. A mismatched shape is an error.
pub(crate) fn parse_auth_url_response(
    content_type: Option<&str>,
    body: &[u8],
) -> Result<TokenSource, ErrorInfo> {
    let ct = content_type.unwrap_or("").to_ascii_lowercase();
    if ct.starts_with("text/plain") || ct.starts_with("application/jwt") {
        let token = String::from_utf8(body.to_vec()).map_err(|_| {
            ErrorInfo::new(
                error_code::AUTH_CONFIGURED_PROVIDER_FAILURE,
                "auth URL returned non-UTF-8 plain-text token",
            )
        })?;
        return Ok(TokenSource::Token(token.trim().to_string()));
    }
    if ct.starts_with("application/json") {
        let value: serde_json::Value = serde_json::from_slice(body).map_err(|e| {
            ErrorInfo::new(
                error_code::AUTH_CONFIGURED_PROVIDER_FAILURE,
                format!("auth URL returned invalid JSON: {e}"),
            )
        })?;
        if value.get("mac").is_some() && value.get("keyName").is_some() {
            let request: TokenRequest = serde_json::from_value(value).map_err(|e| {
                ErrorInfo::new(
                    error_code::AUTH_CONFIGURED_PROVIDER_FAILURE,
                    format!("auth URL returned malformed token request: {e}"),
                )
            })?;
            return Ok(TokenSource::Request(request));
        }
        if value.get("token").is_some() {
            let details: TokenDetails = serde_json::from_value(value).map_err(|e| {
                ErrorInfo::new(
                    error_code::AUTH_CONFIGURED_PROVIDER_FAILURE,
                    format!("auth URL returned malformed token details: {e}"),
                )
            })?;
            return Ok(TokenSource::Details(details));
        }
        return Err(ErrorInfo::new(
            error_code::AUTH_CONFIGURED_PROVIDER_FAILURE,
            "auth URL JSON is neither a token request nor token details",
        ));
    }
    Err(ErrorInfo::new(
        error_code::AUTH_CONFIGURED_PROVIDER_FAILURE,
        format!("auth URL returned unsupported content type {ct:?}"),
    ))
}

/// Resolve the configured mechanism into a fresh credential.
pub(crate) async fn fetch_token(
    mechanism: Arc<AuthMechanism>,
    http: Arc<dyn HttpExecutor>,
    rest_base: String,
    params: TokenParams,
    time_offset: Option<i64>,
) -> Result<TokenDetails, ErrorInfo> {
    let source = match &*mechanism {
        AuthMechanism::Token(token) => TokenSource::Token(token.clone()),
        AuthMechanism::Details(details) => TokenSource::Details(details.clone()),
        AuthMechanism::Key { name, secret } => {
            let timestamp = params
                .timestamp
                .unwrap_or_else(|| now_ms() + time_offset.unwrap_or(0));
            let nonce = params
                .nonce
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
            TokenSource::Request(sign_token_request(name, secret, &params, timestamp, nonce)?)
        }
        AuthMechanism::Callback(callback) => callback(params.clone()).await.map_err(|e| {
            ErrorInfo::new(
                error_code::AUTH_CONFIGURED_PROVIDER_FAILURE,
                format!("auth callback failed: {e}"),
            )
        })?,
        AuthMechanism::Url {
            url,
            method,
            headers,
        } => {
            let req = HttpRequest {
                method: *method,
                url: url.clone(),
                headers: headers.clone(),
                body: None,
                content_type: None,
            };
            let resp = http.execute(req).await.map_err(Error::into_error_info)?;
            if !resp.is_success() {
                return Err(error_from_response(resp.status, &resp.body));
            }
            parse_auth_url_response(resp.content_type.as_deref(), &resp.body)?
        }
    };

    match source {
        TokenSource::Token(token) => Ok(TokenDetails {
            token,
            ..Default::default()
        }),
        TokenSource::Details(details) => Ok(details),
        TokenSource::Request(request) => exchange_token(&*http, &request, &rest_base).await,
    }
}

/// Fetch the server clock (ms since epoch) from the REST `/time` endpoint.
pub(crate) async fn fetch_server_time(
    http: Arc<dyn HttpExecutor>,
    rest_base: String,
) -> Result<i64, ErrorInfo> {
    let req = HttpRequest::get(format!("{rest_base}/time"));
    let resp = http.execute(req).await.map_err(Error::into_error_info)?;
    if !resp.is_success() {
        return Err(error_from_response(resp.status, &resp.body));
    }
    let times: Vec<i64> = serde_json::from_slice(&resp.body).map_err(|e| {
        ErrorInfo::new(
            error_code::BAD_REQUEST,
            format!("time endpoint returned malformed body: {e}"),
        )
    })?;
    times.first().copied().ok_or_else(|| {
        ErrorInfo::new(error_code::BAD_REQUEST, "time endpoint returned empty array")
    })
}

// ---------------------------------------------------------------------------
// Coordinator (event-loop side)
// ---------------------------------------------------------------------------

type TokenWaiter = oneshot::Sender<Result<TokenDetails, ErrorInfo>>;

/// Owns the credential and the local-to-server clock offset. All mutation
/// happens on the engine's execution context; fetches run in spawned tasks
/// identified by a generation counter so a newer request supersedes an older
/// in-flight one (its result is discarded, never force-aborted).
pub(crate) struct AuthCoordinator {
    pub mechanism: Arc<AuthMechanism>,
    pub http: Arc<dyn HttpExecutor>,
    pub rest_base: String,
    credential: Option<TokenDetails>,
    generation: u64,
    in_flight: bool,
    waiters: Vec<TokenWaiter>,
    time_offset: Option<i64>,
}

impl AuthCoordinator {
    pub fn new(mechanism: AuthMechanism, http: Arc<dyn HttpExecutor>, rest_base: String) -> Self {
        AuthCoordinator {
            mechanism: Arc::new(mechanism),
            http,
            rest_base,
            credential: None,
            generation: 0,
            in_flight: false,
            waiters: Vec::new(),
            time_offset: None,
        }
    }

    pub fn credential(&self) -> Option<&TokenDetails> {
        self.credential.as_ref()
    }

    /// The credential an in-flight operation may rely on right now.
    pub fn valid_credential(&self) -> Option<&TokenDetails> {
        self.credential
            .as_ref()
            .filter(|c| c.is_valid_at(self.timestamp()))
    }

    /// Drop the cached credential so the next request must renew.
    pub fn invalidate(&mut self) {
        self.credential = None;
    }

    /// Replace the mechanism (an `authorize` call may carry new options).
    pub fn set_mechanism(&mut self, mechanism: AuthMechanism) {
        self.mechanism = Arc::new(mechanism);
    }

    /// Offset-corrected local clock in ms.
    pub fn timestamp(&self) -> i64 {
        now_ms() + self.time_offset.unwrap_or(0)
    }

    pub fn time_offset(&self) -> Option<i64> {
        self.time_offset
    }

    pub fn set_time_offset(&mut self, server_time: i64, local_at_request: i64) {
        self.time_offset = Some(server_time - local_at_request);
    }

    /// Discard the cached offset (explicit request or detected clock change).
    pub fn discard_time_offset(&mut self) {
        self.time_offset = None;
    }

    /// Register interest in the outcome of the current (or a new) request.
    pub fn add_waiter(&mut self, waiter: TokenWaiter) {
        self.waiters.push(waiter);
    }

    /// Start a new request generation, superseding any in-flight one. Returns
    /// the generation the spawned fetch task must report back with.
    pub fn begin_request(&mut self) -> u64 {
        self.generation += 1;
        self.in_flight = true;
        self.generation
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn current_generation(&self) -> u64 {
        self.generation
    }

    /// Record a fetch outcome. Stale generations are discarded ("last request
    /// wins"). Returns the waiters to resolve when the result is current.
    pub fn complete_request(
        &mut self,
        generation: u64,
        result: &Result<TokenDetails, ErrorInfo>,
    ) -> Vec<TokenWaiter> {
        if generation != self.generation {
            tracing::debug!(generation, "discarding superseded token result");
            return Vec::new();
        }
        self.in_flight = false;
        if let Ok(details) = result {
            self.credential = Some(details.clone());
        }
        std::mem::take(&mut self.waiters)
    }
}
