//! Failure classification.
//!
//! The runtime reacts differently to each class of failure: cancellation is
//! silent, transport failures get one non-streaming retry, resource failures
//! go to model fallback, and context overflow is reported as its own kind.
//! Classification is table-driven; swap in another [`ErrorClassifier`] to
//! change the rules.

use tidewire_core::BackendError;

/// What went wrong, from the runtime's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller stopped the generation.
    Cancelled,
    /// The stream endpoint failed; the plain endpoint may still work.
    Transport,
    /// The model could not serve the request; a different model may.
    Resource(ResourceKind),
    /// The prompt does not fit the model's context window.
    ContextOverflow,
    /// Anything else.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    OutOfMemory,
    Timeout,
    ModelUnavailable,
    BrokenTransport,
}

impl ErrorClass {
    pub fn is_resource(&self) -> bool {
        matches!(self, Self::Resource(_))
    }
}

/// Decides the class of a backend failure.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &BackendError) -> ErrorClass;
}

const CANCELLED_PATTERNS: &[&str] = &["request_aborted", "request aborted"];

const OVERFLOW_PATTERNS: &[&str] = &[
    "context_length_exceeded",
    "context length",
    "context window",
    "maximum context",
    "exceeds the context",
    "too many tokens",
    "prompt is too long",
];

const TRANSPORT_PATTERNS: &[&str] = &[
    "stream unavailable",
    "/chat/stream",
    "stream generation",
    "streaming generation",
    "broken pipe",
    "errno 32",
    "errno32",
];

const RESOURCE_PATTERNS: &[(&str, ResourceKind)] = &[
    ("out of memory", ResourceKind::OutOfMemory),
    ("outofmemory", ResourceKind::OutOfMemory),
    ("vram", ResourceKind::OutOfMemory),
    ("insufficient memory", ResourceKind::OutOfMemory),
    ("not enough memory", ResourceKind::OutOfMemory),
    ("failed to allocate", ResourceKind::OutOfMemory),
    ("timed out", ResourceKind::Timeout),
    ("timeout", ResourceKind::Timeout),
    ("model is loading", ResourceKind::ModelUnavailable),
    ("model not loaded", ResourceKind::ModelUnavailable),
    ("no model loaded", ResourceKind::ModelUnavailable),
    ("failed to load model", ResourceKind::ModelUnavailable),
    ("model unavailable", ResourceKind::ModelUnavailable),
    ("model is unavailable", ResourceKind::ModelUnavailable),
    ("broken pipe", ResourceKind::BrokenTransport),
    ("errno 32", ResourceKind::BrokenTransport),
    ("connection reset", ResourceKind::BrokenTransport),
];

/// Whether `text` contains `HTTP <digits>`.
fn mentions_http_status(text: &str) -> bool {
    text.match_indices("HTTP ").any(|(idx, _)| {
        text[idx + 5..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}

/// Default classifier backed by substring tables.
#[derive(Debug, Clone, Default)]
pub struct PatternClassifier;

impl PatternClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Resource kind of a failure, if it is resource-class at all.
    pub fn resource_kind(&self, error: &BackendError) -> Option<ResourceKind> {
        if matches!(error, BackendError::Timeout(_)) {
            return Some(ResourceKind::Timeout);
        }
        let lower = error.to_string().to_lowercase();
        RESOURCE_PATTERNS
            .iter()
            .find(|(p, _)| lower.contains(p))
            .map(|(_, kind)| *kind)
    }

    /// Whether a failure looks like the stream endpoint itself broke.
    pub fn is_transport_issue(&self, error: &BackendError) -> bool {
        if matches!(
            error,
            BackendError::Http { .. }
                | BackendError::StreamInterrupted(_)
                | BackendError::Network(_)
                | BackendError::Decode(_)
        ) {
            return true;
        }
        let text = error.to_string();
        if mentions_http_status(&text) {
            return true;
        }
        let lower = text.to_lowercase();
        TRANSPORT_PATTERNS.iter().any(|p| lower.contains(p))
    }
}

impl ErrorClassifier for PatternClassifier {
    fn classify(&self, error: &BackendError) -> ErrorClass {
        let lower = error.to_string().to_lowercase();

        if error.is_cancellation() || CANCELLED_PATTERNS.iter().any(|p| lower.contains(p)) {
            return ErrorClass::Cancelled;
        }
        if OVERFLOW_PATTERNS.iter().any(|p| lower.contains(p)) {
            return ErrorClass::ContextOverflow;
        }
        // An HTTP 500 that reports OOM or a loading model goes to fallback.
        match self.resource_kind(error) {
            Some(ResourceKind::OutOfMemory) => {
                return ErrorClass::Resource(ResourceKind::OutOfMemory);
            }
            Some(ResourceKind::ModelUnavailable) => {
                return ErrorClass::Resource(ResourceKind::ModelUnavailable);
            }
            _ => {}
        }
        if self.is_transport_issue(error) {
            return ErrorClass::Transport;
        }
        match self.resource_kind(error) {
            Some(kind) => ErrorClass::Resource(kind),
            None => ErrorClass::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(error: BackendError) -> ErrorClass {
        PatternClassifier::new().classify(&error)
    }

    #[test]
    fn aborted_is_cancelled() {
        assert_eq!(classify(BackendError::Aborted), ErrorClass::Cancelled);
        assert_eq!(
            classify(BackendError::Network("REQUEST_ABORTED".into())),
            ErrorClass::Cancelled
        );
    }

    #[test]
    fn http_status_is_transport() {
        assert_eq!(
            classify(BackendError::Http {
                status: 502,
                detail: "bad gateway".into()
            }),
            ErrorClass::Transport
        );
        assert_eq!(
            classify(BackendError::Generation("upstream said HTTP 500".into())),
            ErrorClass::Transport
        );
    }

    #[test]
    fn stream_generation_messages_are_transport() {
        for msg in [
            "Streaming generation failed",
            "stream unavailable",
            "POST /chat/stream refused",
            "write failed: Errno 32",
        ] {
            assert_eq!(
                classify(BackendError::Generation(msg.into())),
                ErrorClass::Transport,
                "{msg}"
            );
        }
    }

    #[test]
    fn oom_beats_http_status() {
        assert_eq!(
            classify(BackendError::Http {
                status: 500,
                detail: "CUDA out of memory".into()
            }),
            ErrorClass::Resource(ResourceKind::OutOfMemory)
        );
    }

    #[test]
    fn timeouts_and_loading_are_resource() {
        assert_eq!(
            classify(BackendError::Timeout("300s".into())),
            ErrorClass::Resource(ResourceKind::Timeout)
        );
        assert_eq!(
            classify(BackendError::Generation("Model is loading, retry later".into())),
            ErrorClass::Resource(ResourceKind::ModelUnavailable)
        );
    }

    #[test]
    fn overflow_is_its_own_class() {
        assert_eq!(
            classify(BackendError::Generation(
                "prompt exceeds the context window".into()
            )),
            ErrorClass::ContextOverflow
        );
    }

    #[test]
    fn network_and_decode_failures_are_transport() {
        assert_eq!(
            classify(BackendError::Network("connection refused".into())),
            ErrorClass::Transport
        );
        assert_eq!(
            classify(BackendError::Decode("bad json".into())),
            ErrorClass::Transport
        );
    }

    #[test]
    fn unrelated_errors_are_other() {
        assert_eq!(
            classify(BackendError::Generation("the assistant refused".into())),
            ErrorClass::Other
        );
        assert_eq!(
            classify(BackendError::NotConfigured("no backend url".into())),
            ErrorClass::Other
        );
    }

    #[test]
    fn http_mention_requires_digits() {
        assert!(mentions_http_status("HTTP 404: missing"));
        assert!(!mentions_http_status("HTTP client error"));
    }
}
