//! Error types for the tracing core.
//!
//! None of these ever escape into instrumented application code: the hook
//! API absorbs them at the point of occurrence and degrades to "no trace".

use thiserror::Error;

/// Result type alias for tracing core operations.
pub type Result<T> = std::result::Result<T, TraceError>;

/// Errors that can occur inside the tracing core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TraceError {
    /// An inbound continuation header could not be decoded.
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// `exit` was called for an event that is not the most recently entered one.
    #[error("Context mismatch: expected {expected}, found {found}")]
    ContextMismatch { expected: String, found: String },

    /// An event could not be handed to the transport.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Invalid tracer configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TraceError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        TraceError::MalformedHeader(reason.into())
    }

    pub(crate) fn transport(reason: impl Into<String>) -> Self {
        TraceError::TransportFailure(reason.into())
    }
}

impl From<std::io::Error> for TraceError {
    fn from(e: std::io::Error) -> Self {
        TraceError::TransportFailure(e.to_string())
    }
}

impl From<serde_json::Error> for TraceError {
    fn from(e: serde_json::Error) -> Self {
        TraceError::TransportFailure(format!("serialization: {e}"))
    }
}
