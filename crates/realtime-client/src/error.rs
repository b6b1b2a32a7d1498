//! Error types and classification.
//!
//! Two layers: [`Error`] covers mechanical failures (transport, codec, HTTP),
//! while [`ErrorInfo`] is the structured protocol-level error value that state
//! machines retain as a "last known reason" and deliver to listeners.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

/// A boxed error type for the auth callback.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Well-known protocol error codes the state machines act on.
pub mod error_code {
    pub const BAD_REQUEST: i32 = 40000;
    pub const INVALID_CLIENT_ID: i32 = 40012;
    pub const TOKEN_ERROR: i32 = 40140;
    pub const TOKEN_EXPIRED: i32 = 40142;
    pub const TOKEN_ERROR_LIMIT: i32 = 40150;
    pub const FAILED: i32 = 80000;
    pub const SUSPENDED: i32 = 80002;
    pub const DISCONNECTED: i32 = 80003;
    pub const UNABLE_TO_RECOVER: i32 = 80008;
    pub const CONNECTION_TIMED_OUT: i32 = 80014;
    pub const CLOSED: i32 = 80017;
    pub const AUTH_CONFIGURED_PROVIDER_FAILURE: i32 = 80019;
    pub const CHANNEL_OPERATION_FAILED: i32 = 90000;
    pub const CHANNEL_OPERATION_FAILED_INVALID_STATE: i32 = 90001;
    pub const CHANNEL_OPERATION_TIMED_OUT: i32 = 90007;
    pub const UNABLE_TO_REENTER_PRESENCE: i32 = 91004;
}

/// Structured protocol error: numeric code, optional HTTP status, message.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: i32,
    pub status_code: Option<i32>,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        ErrorInfo {
            code,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn with_status(code: i32, status_code: i32, message: impl Into<String>) -> Self {
        ErrorInfo {
            code,
            status_code: Some(status_code),
            message: message.into(),
        }
    }

    /// Token-related error (expired, revoked, invalid) that can be cured by
    /// fetching a fresh credential, provided a renewal means is configured.
    pub fn is_token_error(&self) -> bool {
        (error_code::TOKEN_ERROR..error_code::TOKEN_ERROR_LIMIT).contains(&self.code)
    }

    /// Whether a fresh connection attempt may succeed without intervention.
    ///
    /// An error is retriable when it has no status code, is a server error
    /// (5xx), or carries a well-known connection error code even at 4xx.
    pub fn is_retriable(&self) -> bool {
        const CONNECTION_ERROR_CODES: &[i32] = &[
            error_code::FAILED,
            error_code::DISCONNECTED,
            error_code::SUSPENDED,
            error_code::CLOSED,
            50001, // UNKNOWN_CHANNEL_ERR
            50002, // UNKNOWN_CONNECTION_ERR
        ];
        match self.status_code {
            None => true,
            Some(sc) if sc >= 500 => true,
            Some(_) => CONNECTION_ERROR_CODES.contains(&self.code),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error code={}", self.code)?;
        if let Some(sc) = self.status_code {
            write!(f, " status={sc}")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// Errors produced by the crate's mechanical layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol error: {0}")]
    Protocol(ErrorInfo),

    #[error("token fetch failed: {0}")]
    TokenFetch(BoxError),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

impl From<ErrorInfo> for Error {
    fn from(e: ErrorInfo) -> Self {
        Error::Protocol(e)
    }
}

impl Error {
    /// Collapse a mechanical error into the structured form retained by the
    /// state machines.
    pub fn into_error_info(self) -> ErrorInfo {
        match self {
            Error::Protocol(info) => info,
            Error::Http(e) => {
                let status = e.status().map(|s| s.as_u16() as i32);
                ErrorInfo {
                    code: error_code::AUTH_CONFIGURED_PROVIDER_FAILURE,
                    status_code: status,
                    message: format!("HTTP request failed: {e}"),
                }
            }
            Error::TokenFetch(e) => ErrorInfo::new(
                error_code::AUTH_CONFIGURED_PROVIDER_FAILURE,
                format!("token provider failed: {e}"),
            ),
            other => ErrorInfo::new(error_code::FAILED, other.to_string()),
        }
    }
}
