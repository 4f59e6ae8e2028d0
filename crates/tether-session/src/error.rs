//! Error types for tether-session

use thiserror::Error;

/// Result type alias using tether-session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal errors surfaced by the conversation controller.
///
/// Transient transport failures and malformed records are recovered inside
/// the coordinator and decoder and never appear here.
#[derive(Error, Debug)]
pub enum Error {
    /// A non-retryable error from the protocol layer
    #[error(transparent)]
    Protocol(#[from] tether_protocol::Error),

    /// Network retry budget exhausted
    #[error("Gave up after {attempts} reconnect attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The job's stream never appeared
    #[error("Stream did not start after {attempts} attempts")]
    StartupTimedOut { attempts: u32 },

    /// The backend reported the generation as failed
    #[error("Generation failed: {0}")]
    JobFailed(String),

    /// Resume storage could not be read or written
    #[error("Resume storage error: {0}")]
    Store(String),

    /// Another client holds the conversation's stream lease
    #[error("Conversation is attached by another client ({owner})")]
    LeaseHeld { owner: String },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Store(e.to_string())
    }
}
