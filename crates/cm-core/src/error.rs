//! Error types for cm-core

use thiserror::Error;

/// Main error type for cm-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    #[error("Unknown store kind: {0}")]
    UnknownStore(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(f64),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a `BackendUnavailable` error from a poisoned lock
    pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> Self {
        Error::BackendUnavailable("store lock poisoned".to_string())
    }
}

/// Result type alias for cm-core
pub type Result<T> = std::result::Result<T, Error>;
