//! Error types for the couch library
//!
//! A single error enum covers locator parsing, process supervision and
//! store access. Configuration value quirks are not errors: the INI writer
//! logs them and corrects what can be corrected.

use thiserror::Error;

/// Library error type
#[derive(Debug, Error)]
pub enum CouchError {
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    #[error("Backend not available: {0}")]
    UnsupportedBackend(String),

    #[error("CouchDB did not write its pid file to '{path}' within {seconds}s")]
    StartupTimeout { path: String, seconds: f64 },

    #[error("URI file hasn't been created at '{path}' within {seconds}s, there might be a problem with CouchDB")]
    UriNotPublished { path: String, seconds: f64 },

    #[error("Identifier already in use: {0}")]
    IdentifierConflict(String),

    #[error("Document update conflict: {0}")]
    Conflict(String),

    #[error("Restart failed: {0}")]
    RestartFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cannot change {0}")]
    ImmutableField(String),

    #[error("Debug forwarder is not active")]
    ForwarderInactive,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for CouchError {
    fn from(err: std::io::Error) -> Self {
        CouchError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CouchError {
    fn from(err: serde_json::Error) -> Self {
        CouchError::Json(err.to_string())
    }
}

impl From<reqwest::Error> for CouchError {
    fn from(err: reqwest::Error) -> Self {
        CouchError::Http(err.to_string())
    }
}

impl From<toml::de::Error> for CouchError {
    fn from(err: toml::de::Error) -> Self {
        CouchError::Config(err.to_string())
    }
}

impl From<url::ParseError> for CouchError {
    fn from(err: url::ParseError) -> Self {
        CouchError::InvalidLocator(err.to_string())
    }
}

/// Result type alias using CouchError
pub type Result<T> = std::result::Result<T, CouchError>;
