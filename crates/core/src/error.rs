//! Error types for the Tidewire domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for Tidewire operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Backend errors ---
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    // --- Chat store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures talking to the inference backend.
///
/// `Aborted` is reserved for caller-initiated cancellation and must never be
/// produced by a timeout; the runtime treats it as a silent stop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Request aborted")]
    Aborted,

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status}: {detail}")]
    Http { status: u16, detail: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid backend response: {0}")]
    Decode(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    /// An `error` event pushed by the backend mid-stream. The message is
    /// kept verbatim so classifiers can match on it.
    #[error("{0}")]
    Generation(String),

    #[error("Backend not configured: {0}")]
    NotConfigured(String),
}

impl BackendError {
    /// Whether this error represents a caller cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// HTTP status code, when the backend answered with one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_displays_status_and_detail() {
        let err = Error::Backend(BackendError::Http {
            status: 503,
            detail: "model is loading".into(),
        });
        assert!(err.to_string().contains("HTTP 503"));
        assert!(err.to_string().contains("model is loading"));
    }

    #[test]
    fn generation_error_keeps_message_verbatim() {
        let err = BackendError::Generation("CUDA out of memory".into());
        assert_eq!(err.to_string(), "CUDA out of memory");
    }

    #[test]
    fn only_aborted_is_cancellation() {
        assert!(BackendError::Aborted.is_cancellation());
        assert!(!BackendError::Timeout("300s".into()).is_cancellation());
        assert_eq!(
            BackendError::Http {
                status: 500,
                detail: String::new()
            }
            .status(),
            Some(500)
        );
        assert_eq!(BackendError::Network("refused".into()).status(), None);
    }
}
