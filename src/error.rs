//! Error taxonomy for provisioning and the JSON error responses of the API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failure of the underlying key-value store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt document at '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failure to produce or remove a proxy-config artifact
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to write artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("template error: {0}")]
    Template(String),

    #[error("reload command failed: {0}")]
    Reload(String),
}

/// Errors surfaced by the provisioning core.
///
/// An already-provisioned branch is not an error; see
/// [`CreateOutcome::AlreadyProvisioned`](crate::lifecycle::CreateOutcome).
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("no free port left in pool for {ip}")]
    PoolExhausted { ip: String },

    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    #[error("store failed: {0}")]
    Store(#[from] StoreError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl ProvisionError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProvisionError::NotFound(_) => ErrorCode::NotFound,
            ProvisionError::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            ProvisionError::Render(_) => ErrorCode::RenderFailed,
            ProvisionError::Store(_) => ErrorCode::StoreFailed,
            ProvisionError::InvalidInput(_) => ErrorCode::InvalidInput,
            ProvisionError::Conflict(_) => ErrorCode::Conflict,
        }
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

/// Error codes returned in API error bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed request body, IP or branch identifier
    InvalidInput,
    /// Unknown branch, IP or route
    NotFound,
    /// Server name already routed to another branch
    Conflict,
    /// Every port in the IP's pool is allocated
    PoolExhausted,
    /// Proxy config could not be written or reloaded
    RenderFailed,
    /// Key-value store operation failed
    StoreFailed,
    /// Anything else
    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::RenderFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::StoreFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// HTTP status code (for reference)
    pub code: u16,
    /// Machine-readable error kind
    pub status: ErrorCode,
    /// Human-readable error message
    pub error: String,
}

impl ErrorResponse {
    pub fn new(status: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            code: status.status_code().as_u16(),
            status,
            error: error.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":{},"status":"INTERNAL_ERROR","error":"{}"}}"#,
                self.code,
                self.error.replace('\"', "\\\"")
            )
        })
    }
}

/// Create a JSON error response for the given code
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
