//! Error types for Markwise.
//!
//! Library crates use [`MarkwiseError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all Markwise operations.
#[derive(Debug, thiserror::Error)]
pub enum MarkwiseError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Connection-level failure (DNS, reset, refused).
    #[error("network error: {0}")]
    Network(String),

    /// A single network or LLM call exceeded its timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Non-success HTTP status from a page or provider.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Provider asked us to slow down.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// HTML parsing or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// LLM output did not match the expected JSON schema.
    #[error("schema error: {message}")]
    Schema { message: String },

    /// Every render engine failed and no title could be salvaged.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Cache store error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Non-retryable LLM provider error.
    #[error("llm error: {0}")]
    Llm(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad input feed, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A worker task panicked or was aborted.
    #[error("task failed: {0}")]
    Task(String),

    /// The run was cancelled before this work item reached a network call.
    #[error("cancelled")]
    Cancelled,

    /// No record produced usable metadata, so there is nothing to organize.
    #[error("no usable metadata: 0 of {attempted} records succeeded")]
    NoUsableMetadata { attempted: usize },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, MarkwiseError>;

impl MarkwiseError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a schema error from any displayable message.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an HTTP status error.
    pub fn http(status: u16, msg: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short machine-readable label, used in run summaries and exports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Http { .. } => "http",
            Self::RateLimited { .. } => "rate_limited",
            Self::Parse { .. } => "parse",
            Self::Schema { .. } => "schema",
            Self::Fetch(_) => "fetch",
            Self::Storage(_) => "storage",
            Self::Llm(_) => "llm",
            Self::Io { .. } => "io",
            Self::Validation { .. } => "validation",
            Self::Task(_) => "task",
            Self::Cancelled => "cancelled",
            Self::NoUsableMetadata { .. } => "no_usable_metadata",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = MarkwiseError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = MarkwiseError::http(403, "https://example.com/private");
        assert_eq!(err.to_string(), "HTTP 403: https://example.com/private");

        let err = MarkwiseError::NoUsableMetadata { attempted: 7 };
        assert!(err.to_string().contains("0 of 7"));
    }

    #[test]
    fn kind_labels() {
        assert_eq!(MarkwiseError::Cancelled.kind(), "cancelled");
        assert!(MarkwiseError::Cancelled.is_cancelled());
        assert_eq!(MarkwiseError::schema("missing name").kind(), "schema");
        assert!(!MarkwiseError::Fetch("x".into()).is_cancelled());
    }
}
