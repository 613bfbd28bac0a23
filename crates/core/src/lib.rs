//! # Tidewire Core
//!
//! Domain types, traits, and error definitions for the Tidewire streaming
//! generation pipeline. This crate has no HTTP or runtime machinery of its
//! own; it defines the model that the backend and runtime crates implement
//! against.
//!
//! ## Layout
//!
//! - [`backend`]: the `Backend` trait plus request/reply payloads
//! - [`stream`]: typed server-push events
//! - [`history`]: conversation entries and the backend history limits
//! - [`model`]: model catalog, context budgets, fallback plans
//! - [`store`]: the chat-store collaborator
//! - [`error`]: one error enum per bounded context

pub mod backend;
pub mod error;
pub mod history;
pub mod model;
pub mod store;
pub mod stream;

// Re-export key types at crate root for ergonomics
pub use backend::{Attachment, AttachmentKind, Backend, ChatReply, ChatRequest, StreamMode};
pub use error::{BackendError, Error, Result, StoreError};
pub use history::{HistoryEntry, Role, normalize_history};
pub use model::{
    ContextBudget, ContextRequirements, FallbackPlan, FallbackProfile, ModelCandidate,
    ModelCatalog, ModelInfo, ModelParams,
};
pub use store::{ChatStore, InMemoryChatStore};
pub use stream::StreamEvent;
