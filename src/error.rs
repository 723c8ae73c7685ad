//! Error types shared by the relay engine, event sources and configuration.

use thiserror::Error;

use crate::session::SessionState;

/// Comprehensive error types for event intake and session handling.
#[derive(Error, Debug)]
pub enum RelayError {
    /// I/O error when reading recorded events
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error at line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Missing or empty required field in an inbound payload
    #[error("Missing required field '{field}' in {event} event")]
    MalformedEvent { field: String, event: String },

    /// Event name that the normalizer does not understand
    #[error("Unsupported event type: {event}")]
    UnknownEvent { event: String },

    /// No session is registered for the given streamer
    #[error("No active session found for '{handle}'")]
    SessionNotFound { handle: String },

    /// A session is already registered for the given streamer
    #[error("Session already exists for '{handle}'")]
    AlreadyConnected { handle: String },

    /// Session state machine rejected the transition
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// Relay task is gone (shutdown or panic)
    #[error("Relay engine is not running")]
    EngineStopped,
}

impl RelayError {
    /// Create a malformed event error
    pub fn malformed(field: impl Into<String>, event: impl Into<String>) -> Self {
        Self::MalformedEvent {
            field: field.into(),
            event: event.into(),
        }
    }

    /// Create a session not found error
    pub fn session_not_found(handle: impl Into<String>) -> Self {
        Self::SessionNotFound {
            handle: handle.into(),
        }
    }

    /// 呼び出し側に返しても処理を継続できるエラーかどうか
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::EngineStopped)
    }
}

/// Result alias used across the crate
pub type RelayResult<T> = Result<T, RelayError>;
