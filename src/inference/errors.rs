//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility — these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors that can occur during inference operations.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the inference server failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed {
        endpoint: String,
        reason: String,
    },

    /// The inference server did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout {
        duration_secs: u64,
    },

    /// Non-2xx HTTP response from the inference server.
    #[error("HTTP {status}: {body}")]
    HttpError {
        status: u16,
        body: String,
    },

    /// SSE stream parsing or chunk-level error.
    #[error("stream error: {reason}")]
    StreamError {
        reason: String,
    },

    /// The server accepted the request but reported a generation failure.
    #[error("server error: {message}")]
    ServerError {
        message: String,
    },

    /// The request was interrupted before the server finished generating.
    #[error("completion interrupted after {} bytes", partial_text.len())]
    Cancelled {
        partial_text: String,
    },

    /// Client configuration is invalid.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// Spawning or supervising the owned server process failed.
    #[error("server process error: {reason}")]
    ProcessError {
        reason: String,
    },
}

impl InferenceError {
    /// Whether this error is the result of an interrupt rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InferenceError::Cancelled { .. })
    }

    /// Map a `reqwest` transport error onto the taxonomy above.
    pub(crate) fn from_transport(endpoint: &str, timeout_secs: u64, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            InferenceError::Timeout {
                duration_secs: timeout_secs,
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        }
    }
}
