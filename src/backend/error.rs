//! Error types for the prefetch engine

use thiserror::Error;

/// Result type for prefetch operations
pub type Result<T> = std::result::Result<T, PrefetchError>;

/// Errors surfaced by the prefetch engine and its collaborators
#[derive(Error, Debug)]
pub enum PrefetchError {
    /// Remote source failure (page list, chapter feed, page download)
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Record could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Client(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for PrefetchError {
    fn from(err: sqlx::Error) -> Self {
        PrefetchError::Storage(err.to_string())
    }
}

/// A failed remote call. Cloneable so a single download can be awaited by
/// several callers at once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct FetchError {
    /// HTTP status, when the remote answered with one
    pub status: Option<u16>,
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn timeout(what: &str) -> Self {
        Self::new(format!("{} timed out", what))
    }

    /// Status code fed back to the source behaviour model.
    ///
    /// An explicit HTTP status wins. Otherwise the message is searched for the
    /// two codes sources use to defend themselves; anything else is `-1`
    /// (network or timeout).
    pub fn status_code(&self) -> i32 {
        if let Some(status) = self.status {
            return i32::from(status);
        }
        if self.message.contains("429") {
            429
        } else if self.message.contains("403") {
            403
        } else {
            -1
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let message = if err.is_timeout() {
            format!("request timed out: {}", err)
        } else {
            err.to_string()
        };
        Self { status, message }
    }
}
