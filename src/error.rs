//! The broker's error taxonomy.
//!
//! Every fallible operation in the core (cache, broker, orchestrator) returns
//! `Result<T, BrokerError>`. Glue code (config parsing, startup filesystem
//! checks) is free to use `anyhow::Error` and fold it into `BrokerError::Internal`
//! at the boundary.

use serde_json::Value;

/// The taxonomy described in the design: each variant maps to exactly one
/// caller-facing HTTP status, except `ApiError` which passes its own code through.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("no executors are currently connected")]
    NoExecutors,

    #[error("executor '{0}' disconnected while handling the request")]
    ExecutorGone(String),

    #[error("executor did not respond in time")]
    GatewayTimeout,

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("upstream error {code}: {detail}")]
    ApiError {
        code: u16,
        detail: String,
        details: Option<Value>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid size: {0}")]
    InvalidSize(String),

    #[error("offset mismatch: expected {expected}, got {got}")]
    OffsetMismatch { expected: u64, got: u64 },

    #[error("invalid upload command: {0}")]
    InvalidCommand(String),

    #[error("rebuild-on-expire retry failed: {0}")]
    RebuildFailed(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BrokerError {
    /// The HTTP status code the caller surface maps this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            BrokerError::NoExecutors => 503,
            BrokerError::ExecutorGone(_) => 503,
            BrokerError::GatewayTimeout => 504,
            BrokerError::BadGateway(_) => 502,
            BrokerError::ApiError { code, .. } => *code,
            BrokerError::NotFound(_) => 404,
            BrokerError::InvalidSize(_) | BrokerError::OffsetMismatch { .. } | BrokerError::InvalidCommand(_) => 400,
            BrokerError::RebuildFailed(_) => 500,
            BrokerError::Internal(_) => 500,
        }
    }

    /// Renders the cloud API's `{error: {code, message, details?}}` error body.
    pub fn to_error_body(&self) -> Value {
        let mut error = serde_json::json!({
            "code": self.status_code(),
            "message": self.to_string(),
        });
        if let BrokerError::ApiError { details: Some(details), .. } = self {
            error["details"] = details.clone();
        }
        serde_json::json!({ "error": error })
    }

    /// True for the "file not found" family of upstream errors that the
    /// orchestrator's rebuild-on-expire path reacts to.
    pub fn looks_like_missing_file(&self) -> bool {
        match self {
            BrokerError::ApiError { detail, .. } => {
                let lower = detail.to_lowercase();
                lower.contains("not found") || lower.contains("file not found")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
