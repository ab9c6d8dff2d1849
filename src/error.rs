// src/error.rs

//! Crate-wide error type and result alias.
//!
//! The variants mirror the HTTP surface: handlers map them onto status
//! codes without inspecting error text.

use thiserror::Error;

/// Errors produced across the paddock daemon
#[derive(Error, Debug)]
pub enum Error {
    /// Record, alias, fingerprint or operation absent
    #[error("{0} not found")]
    NotFound(String),

    /// Duplicate fingerprint in project, duplicate alias name
    #[error("{0}")]
    AlreadyExists(String),

    /// Shape or constraint failure on user input
    #[error("{0}")]
    Validation(String),

    /// ETag mismatch on PUT/PATCH
    #[error("ETag doesn't match: {0}")]
    PreconditionFailed(String),

    /// Authorization denial
    #[error("{0}")]
    Forbidden(String),

    /// Project image-space budget hit during write
    #[error("Project image storage quota exceeded")]
    QuotaExceeded,

    /// Archive integrity violation (hash mismatch) or corrupt store
    #[error("{0}")]
    Integrity(String),

    /// Database failure
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Websocket transport failure
    #[error("Websocket error: {0}")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Catch-all for wrapped context errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a not-found error for an entity kind
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// True if this error should surface as HTTP 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
            || matches!(self, Self::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("Invalid JSON: {}", err))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Validation(format!("Invalid YAML: {}", err))
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;
