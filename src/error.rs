//! Skald error types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a failed backend call.
///
/// `RateLimited` and `Timeout` are kept distinct from `Unknown` so callers
/// can decide whether a retry is worthwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    RateLimited,
    Timeout,
    Unknown,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendErrorKind::RateLimited => "rate limited",
            BackendErrorKind::Timeout => "timeout",
            BackendErrorKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Skald error types
#[derive(Debug, thiserror::Error)]
pub enum SkaldError {
    // Lookup and input errors (never retried)
    /// Unknown or inactive function. Both cases read the same to callers.
    #[error("function '{0}' does not exist or is disabled")]
    NotFound(String),

    #[error("invalid input for '{field}': {reason}")]
    ValidationFailed { field: String, reason: String },

    #[error("function '{0}' does not support streaming")]
    StreamingUnsupported(String),

    // Admission control
    #[error("server busy: concurrent stream limit of {limit} reached")]
    CapacityExceeded { limit: usize },

    // Upstream errors
    #[error("backend error ({kind}): {message}")]
    Backend {
        kind: BackendErrorKind,
        message: String,
    },

    #[error("request cancelled")]
    Cancelled,

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SkaldError {
    /// Shorthand for a validation failure on `field`.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SkaldError::ValidationFailed {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a backend failure of the given kind.
    pub fn backend(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        SkaldError::Backend {
            kind,
            message: message.into(),
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    ///
    /// Rate limits, backend timeouts and admission rejections are transient.
    /// Lookup, validation and configuration errors are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            SkaldError::CapacityExceeded { .. } => true,
            SkaldError::Backend { kind, .. } => matches!(
                kind,
                BackendErrorKind::RateLimited | BackendErrorKind::Timeout
            ),
            _ => false,
        }
    }

    /// Stable machine-readable code for transports and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            SkaldError::NotFound(_) => "FUNCTION_NOT_FOUND",
            SkaldError::ValidationFailed { .. } => "VALIDATION_ERROR",
            SkaldError::StreamingUnsupported(_) => "STREAMING_UNSUPPORTED",
            SkaldError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            SkaldError::Backend { kind, .. } => match kind {
                BackendErrorKind::RateLimited => "BACKEND_RATE_LIMITED",
                BackendErrorKind::Timeout => "BACKEND_TIMEOUT",
                BackendErrorKind::Unknown => "BACKEND_ERROR",
            },
            SkaldError::Cancelled => "CANCELLED",
            SkaldError::Json(_)
            | SkaldError::Io(_)
            | SkaldError::Configuration(_)
            | SkaldError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status a transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            SkaldError::NotFound(_) => 404,
            SkaldError::ValidationFailed { .. } | SkaldError::StreamingUnsupported(_) => 400,
            SkaldError::CapacityExceeded { .. } => 503,
            SkaldError::Backend { kind, .. } => match kind {
                BackendErrorKind::RateLimited => 429,
                BackendErrorKind::Timeout => 504,
                BackendErrorKind::Unknown => 502,
            },
            SkaldError::Cancelled => 499,
            _ => 500,
        }
    }
}

/// Result type alias for Skald operations
pub type Result<T> = std::result::Result<T, SkaldError>;
