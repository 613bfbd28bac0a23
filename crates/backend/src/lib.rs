//! Backend implementations for Tidewire.
//!
//! - [`http::HttpBackend`] talks to the inference server over HTTP and
//!   decodes its server-push stream with [`sse::SseDecoder`].
//! - [`classify`] sorts failures into transport, resource, overflow and
//!   cancellation classes.
//! - [`fallback::ModelFallback`] retries a failed generation on other
//!   models from the catalog.

pub mod classify;
pub mod fallback;
pub mod http;
pub mod sse;

pub use classify::{ErrorClass, ErrorClassifier, PatternClassifier, ResourceKind};
pub use fallback::{FallbackOutcome, ModelFallback};
pub use http::{HttpBackend, Timeouts};
pub use sse::{SseDecoder, SseFrame};
