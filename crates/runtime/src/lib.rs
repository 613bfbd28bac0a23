//! # Tidewire Runtime
//!
//! Turns one user message into one assistant reply: sizes the request
//! against the model's context window, streams the reply through the delta
//! reconciler, and recovers from transport and resource failures.
//!
//! The entry point is [`AssistantRuntime`]:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tidewire_backend::HttpBackend;
//! # use tidewire_core::InMemoryChatStore;
//! # use tidewire_runtime::{AssistantRuntime, TurnRequest};
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(HttpBackend::new("http://127.0.0.1:5055", None)?);
//! let runtime = Arc::new(AssistantRuntime::new(backend, Arc::new(InMemoryChatStore::new())));
//!
//! let mut turn = runtime.spawn_turn(TurnRequest::new("chat-1", "Hello!"));
//! while let Some(event) = turn.events.recv().await {
//!     println!("{event:?}");
//! }
//! let outcome = turn.result.await??;
//! println!("{}", outcome.text);
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod reconcile;
pub mod runtime;
pub mod session;
pub mod tuning;

pub use context::{
    CompressionCandidate, CompressionLayer, CompressionSummary, ContextGuard, GuardSettings,
    NextReplyMode, RequestPlan, UsageSnapshot,
};
pub use reconcile::{DeltaReconciler, resolve_delta};
pub use runtime::{
    AppliedCompression, AssistantRuntime, ToolPhase, TurnError, TurnEvent, TurnHandle,
    TurnOutcome, TurnRequest,
};
pub use session::{GenerationSession, SessionGuard, SessionRegistry};
pub use tuning::{ScenarioProfile, ScenarioTuner};
