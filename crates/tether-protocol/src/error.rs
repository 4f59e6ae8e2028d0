//! Error types for tether-protocol

use thiserror::Error;

/// Result type alias using tether-protocol Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the job backend
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The job's stream does not exist (yet)
    #[error("Stream not found")]
    NotFound,

    /// Backend answered with a non-success status
    #[error("Backend returned {code}: {message}")]
    Status { code: u16, message: String },

    /// The byte stream broke mid-read
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a status error from a code and message
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::Transport(_) | Error::NotFound => true,
            Error::Status { code, .. } => *code == 408 || *code == 429 || *code >= 500,
            _ => false,
        }
    }

    /// Whether this is the "job has not started writing yet" condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}
