//! The error taxonomy shared by every component.
//!
//! Every remote-facing operation resolves to one of these kinds. They map
//! directly onto HTTP status codes in the local HTTP surface and onto
//! `{ok:false, error}` envelopes on the wire protocols.

use thiserror::Error;

/// Abstract, exhaustive error kind for goop2 operations.
#[derive(Debug, Error, Clone)]
pub enum GoopError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("resource exceeded: {0}")]
    ResourceExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type GoopResult<T> = Result<T, GoopError>;

impl GoopError {
    /// Short machine-readable tag, used in wire responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GoopError::BadRequest(_) => "bad_request",
            GoopError::NotFound(_) => "not_found",
            GoopError::Forbidden(_) => "forbidden",
            GoopError::Conflict(_) => "conflict",
            GoopError::Timeout(_) => "timeout",
            GoopError::Unreachable(_) => "unreachable",
            GoopError::ResourceExceeded(_) => "resource_exceeded",
            GoopError::Internal(_) => "internal",
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Maps onto a local HTTP surface status code.
    pub fn status_code(&self) -> u16 {
        match self {
            GoopError::BadRequest(_) => 400,
            GoopError::Forbidden(_) => 403,
            GoopError::NotFound(_) => 404,
            GoopError::Conflict(_) => 409,
            GoopError::Timeout(_) => 408,
            GoopError::Unreachable(_) => 502,
            GoopError::ResourceExceeded(_) => 429,
            GoopError::Internal(_) => 500,
        }
    }
}

impl From<rusqlite::Error> for GoopError {
    fn from(e: rusqlite::Error) -> Self {
        GoopError::Internal(format!("storage: {e}"))
    }
}

impl From<std::io::Error> for GoopError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => GoopError::NotFound(e.to_string()),
            std::io::ErrorKind::TimedOut => GoopError::Timeout(e.to_string()),
            _ => GoopError::Internal(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for GoopError {
    fn from(e: serde_json::Error) -> Self {
        GoopError::BadRequest(format!("json: {e}"))
    }
}
