//! Error taxonomy for the backup engine.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential lookup failed: {0}")]
    Credentials(String),

    #[error("Rate limited by API (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("API rejected request ({status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Repository enumeration failed: {0}")]
    Enumeration(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Storage error: {message}")]
    Storage { message: String, retryable: bool },

    #[error("Storage setup failed: {0}")]
    StorageSetup(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How a retry policy should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient failure, back off exponentially and try again
    Retry,
    /// Throttled upstream, wait for the given window (if known) and try again
    Throttled(Option<Duration>),
    /// Not retryable, surface immediately
    NoRetry,
}

impl BackupError {
    pub fn retry_decision(&self) -> RetryDecision {
        match self {
            Self::RateLimited { retry_after } => RetryDecision::Throttled(*retry_after),
            Self::TransientNetwork(_) | Self::Timeout(_) => RetryDecision::Retry,
            Self::Storage { retryable: true, .. } => RetryDecision::Retry,
            Self::Http(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                RetryDecision::Retry
            }
            _ => RetryDecision::NoRetry,
        }
    }

    /// True for "this thing does not exist" answers, which callers often treat
    /// as an expected absence rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Permanent { status: 404 | 410, .. }
        )
    }

    /// Errors that make the whole run impossible.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Credentials(_) | Self::Enumeration(_) | Self::StorageSetup(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
