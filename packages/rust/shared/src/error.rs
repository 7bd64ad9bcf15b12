//! Error types for refeed.
//!
//! Library crates use [`RefeedError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all refeed operations.
#[derive(Debug, thiserror::Error)]
pub enum RefeedError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to a feed source or API.
    #[error("network error: {0}")]
    Network(String),

    /// Feed, HTML, or model response parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The shared state store or artifact backend is unavailable or failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Rendering or extraction of a resource failed in a way worth retrying.
    #[error("fetch of {address} failed: {message}")]
    TransientFetch { address: String, message: String },

    /// The input can never succeed (e.g. an article without a link).
    #[error("permanent resource error: {message}")]
    PermanentResource { message: String },

    /// External document converter or script exited unsuccessfully.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Language-model call or response handling failed.
    #[error("llm error: {0}")]
    Llm(String),

    /// A bounded external call exceeded its wall-clock limit.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// A job exhausted its attempts or was failed by a child.
    #[error("job {job_id} failed permanently: {message}")]
    TerminalJob { job_id: String, message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad payload, invalid state string, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RefeedError>;

impl RefeedError {
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

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a storage error from any displayable message.
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        Self::Storage(msg.to_string())
    }

    /// Create a retryable fetch error for `address`.
    pub fn transient(address: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TransientFetch {
            address: address.into(),
            message: msg.into(),
        }
    }

    /// Create a non-retryable resource error.
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::PermanentResource {
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

    /// Whether a worker should spend another attempt on a job that hit this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::PermanentResource { .. }
                | Self::Validation { .. }
                | Self::Config { .. }
                | Self::Parse { .. }
                | Self::TerminalJob { .. }
        )
    }
}

impl From<serde_json::Error> for RefeedError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(e.to_string())
    }
}
