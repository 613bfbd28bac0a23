//! Assistant runtime: drives one chat turn from draft to persisted reply.
//!
//! A turn goes through these steps:
//!
//! 1. Scenario parameters are pushed to the backend (best effort).
//! 2. The context guard sizes the request and compresses the history when
//!    needed.
//! 3. The reply is streamed; every delta passes through the reconciler and
//!    the reconciled text is published as a [`TurnEvent::Partial`].
//! 4. Failures are recovered by class: a broken stream is retried once on
//!    the plain endpoint, a resource failure goes to model fallback, a
//!    cancellation ends the turn quietly, and anything else degrades to the
//!    partial text when there is some.
//!
//! The runtime is the only layer that turns a backend failure into an error
//! for the caller.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tidewire_backend::{ErrorClass, ErrorClassifier, ModelFallback, PatternClassifier};
use tidewire_config::AppConfig;
use tidewire_core::backend::DEFAULT_CHAT_ID;
use tidewire_core::{
    Attachment, Backend, BackendError, ChatReply, ChatRequest, ChatStore, HistoryEntry,
    StoreError, StreamEvent, StreamMode,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{
    CompressionCandidate, ContextGuard, GuardError, GuardSettings, NotCompressible, RequestPlan,
    UsageSnapshot,
};
use crate::reconcile::DeltaReconciler;
use crate::session::{GenerationSession, SessionRegistry};
use crate::tuning::{ScenarioProfile, ScenarioTuner};

/// Buffer of the event channel opened by [`AssistantRuntime::spawn_turn`].
const EVENT_BUFFER: usize = 256;

/// How long a new turn waits for the turn it replaced to wind down.
const REPLACED_TURN_WAIT: Duration = Duration::from_secs(5);

// ── Turn types ──────────────────────────────────────────────────────────

/// One user submission.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub chat_id: String,
    pub message: String,
    pub attachments: Vec<Attachment>,
}

impl TurnRequest {
    pub fn new(chat_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            message: message.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Start,
    Result,
}

/// Progress published while a turn runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// The full reconciled reply so far.
    Partial { text: String },

    /// The model serving the turn.
    Model { label: String },

    Status { message: String },

    Tool { phase: ToolPhase, payload: Value },

    /// The history was compressed before sending.
    Compressed(AppliedCompression),
}

/// Compression applied to a turn's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedCompression {
    pub strategy: String,
    pub source_messages: usize,
    pub target_messages: usize,
    pub saved_tokens: u32,
    pub resolved_overflow: bool,
    pub forced: bool,
}

impl AppliedCompression {
    fn from_plan(plan: &RequestPlan) -> Option<Self> {
        plan.compressed.then(|| Self {
            strategy: plan.strategy.clone().unwrap_or_default(),
            source_messages: plan.source_messages,
            target_messages: plan.target_messages,
            saved_tokens: plan.saved_tokens,
            resolved_overflow: plan.resolved_overflow,
            forced: plan.forced,
        })
    }
}

/// How a turn ended, when it did not fail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub text: String,
    pub model: Option<String>,
    pub mode: StreamMode,
    /// Stopped by the user or replaced by a newer turn.
    pub cancelled: bool,
    /// Set when a fallback model produced the reply.
    pub served_by: Option<String>,
    pub chat_title: Option<String>,
    pub tool_events: Vec<Value>,
    pub compression: Option<AppliedCompression>,
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Nothing to send")]
    EmptyMessage,

    #[error("Request needs {used_tokens} tokens but the context window holds {context_window}")]
    ContextOverflow {
        used_tokens: u32,
        context_window: u32,
    },

    #[error("History cannot be compressed: {0}")]
    NotCompressible(NotCompressible),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("stream ended without data")]
    EmptyStream,
}

impl From<GuardError> for TurnError {
    fn from(error: GuardError) -> Self {
        match error {
            GuardError::Store(e) => Self::Store(e),
            GuardError::NotCompressible(reason) => Self::NotCompressible(reason),
        }
    }
}

impl TurnError {
    fn overflow(usage: &UsageSnapshot) -> Self {
        Self::ContextOverflow {
            used_tokens: usage.used_tokens,
            context_window: usage.context_window,
        }
    }
}

/// A turn running on its own task.
pub struct TurnHandle {
    pub events: mpsc::Receiver<TurnEvent>,
    pub result: JoinHandle<Result<TurnOutcome, TurnError>>,
}

// ── Internal state ──────────────────────────────────────────────────────

/// How a stream ended without a transport error.
enum StreamEnd {
    Done(ChatReply),
    /// The channel closed without a terminal event.
    Closed,
}

#[derive(Default)]
struct TurnProgress {
    reconciler: DeltaReconciler,
    model: Option<String>,
    tool_events: Vec<Value>,
}

impl TurnProgress {
    fn outcome(&self, reply: ChatReply, mode: StreamMode, served_by: Option<String>) -> TurnOutcome {
        let text = if reply.text.is_empty() {
            self.reconciler.text().to_string()
        } else {
            reply.text
        };
        TurnOutcome {
            text,
            model: reply.model.or_else(|| served_by.clone()).or_else(|| self.model.clone()),
            mode,
            cancelled: false,
            served_by,
            chat_title: reply.chat_title,
            tool_events: if reply.tool_events.is_empty() {
                self.tool_events.clone()
            } else {
                reply.tool_events
            },
            compression: None,
        }
    }

    fn partial(&self, cancelled: bool) -> TurnOutcome {
        TurnOutcome {
            text: self.reconciler.text().to_string(),
            model: self.model.clone(),
            mode: if self.reconciler.is_empty() {
                StreamMode::Streaming
            } else {
                StreamMode::PartialStream
            },
            cancelled,
            served_by: None,
            chat_title: None,
            tool_events: self.tool_events.clone(),
            compression: None,
        }
    }
}

/// Everything the recovery paths need about the running turn.
struct TurnContext<'a> {
    chat_id: &'a str,
    model_id: &'a str,
    request: &'a ChatRequest,
    session: &'a GenerationSession,
    events: &'a mpsc::Sender<TurnEvent>,
    usage: UsageSnapshot,
}

impl TurnContext<'_> {
    async fn emit(&self, event: TurnEvent) {
        // The caller may have stopped listening; the turn still completes.
        let _ = self.events.send(event).await;
    }
}

fn chat_key(chat_id: &str) -> String {
    let trimmed = chat_id.trim();
    if trimmed.is_empty() {
        DEFAULT_CHAT_ID.to_string()
    } else {
        trimmed.to_string()
    }
}

/// `send_chat` that gives up as soon as `cancel` fires.
async fn send_cancellable(
    backend: &dyn Backend,
    request: ChatRequest,
    cancel: &CancellationToken,
) -> Result<ChatReply, BackendError> {
    if cancel.is_cancelled() {
        return Err(BackendError::Aborted);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackendError::Aborted),
        reply = backend.send_chat(request) => reply,
    }
}

// ── Runtime ─────────────────────────────────────────────────────────────

/// Coordinates guard, transport, reconciler and fallback for every turn.
pub struct AssistantRuntime {
    backend: Arc<dyn Backend>,
    store: Arc<dyn ChatStore>,
    guard: ContextGuard,
    fallback: ModelFallback,
    classifier: Arc<dyn ErrorClassifier>,
    tuner: ScenarioTuner,
    sessions: SessionRegistry,
    scenario: ScenarioProfile,
    auto_apply_scenario: bool,
}

impl AssistantRuntime {
    pub fn new(backend: Arc<dyn Backend>, store: Arc<dyn ChatStore>) -> Self {
        Self {
            guard: ContextGuard::new(backend.clone(), store.clone(), GuardSettings::default()),
            fallback: ModelFallback::new(backend.clone()),
            classifier: Arc::new(PatternClassifier::new()),
            tuner: ScenarioTuner::new(backend.clone()),
            sessions: SessionRegistry::new(),
            scenario: ScenarioProfile::Auto,
            auto_apply_scenario: false,
            backend,
            store,
        }
    }

    /// Build a runtime with every setting taken from `config`.
    pub fn from_config(
        config: &AppConfig,
        backend: Arc<dyn Backend>,
        store: Arc<dyn ChatStore>,
    ) -> Self {
        let fallback = ModelFallback::new(backend.clone())
            .with_profile(config.fallback.profile())
            .enabled(config.fallback.enabled);
        Self::new(backend, store)
            .with_guard_settings(GuardSettings::from(&config.context_guard))
            .with_fallback(fallback)
            .with_scenario(
                ScenarioProfile::parse(&config.model.scenario_profile),
                config.model.auto_apply_scenario,
            )
            .with_model(config.model.default_model.clone().unwrap_or_default())
    }

    pub fn with_guard_settings(mut self, settings: GuardSettings) -> Self {
        let model_id = self.guard.model_id();
        self.guard = ContextGuard::new(self.backend.clone(), self.store.clone(), settings)
            .with_model(model_id);
        self
    }

    pub fn with_fallback(mut self, fallback: ModelFallback) -> Self {
        self.fallback = fallback.with_classifier(self.classifier.clone());
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.fallback = self.fallback.with_classifier(classifier.clone());
        self.classifier = classifier;
        self
    }

    pub fn with_scenario(mut self, profile: ScenarioProfile, auto_apply: bool) -> Self {
        self.scenario = profile;
        self.auto_apply_scenario = auto_apply;
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.guard = self.guard.with_model(model_id);
        self
    }

    pub fn guard(&self) -> &ContextGuard {
        &self.guard
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn model_id(&self) -> String {
        self.guard.model_id()
    }

    pub fn set_model(&self, model_id: &str) {
        self.guard.set_model(model_id);
    }

    /// Adopt the backend's selected model.
    ///
    /// When the backend has none selected, the configured model is
    /// selected on it instead.
    pub async fn sync_model(&self) -> Result<String, BackendError> {
        let catalog = self.backend.list_models().await?;
        let model_id = match catalog.selected_id() {
            Some(id) => id.to_string(),
            None => {
                let configured = self.guard.model_id();
                if !configured.is_empty() {
                    self.backend.select_model(&configured, false).await?;
                }
                configured
            }
        };
        self.guard.set_model(&model_id);
        Ok(model_id)
    }

    /// Run a turn on its own task and hand back its event stream.
    pub fn spawn_turn(self: &Arc<Self>, request: TurnRequest) -> TurnHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let runtime = Arc::clone(self);
        let result = tokio::spawn(async move { runtime.run_turn(request, tx).await });
        TurnHandle { events: rx, result }
    }

    /// Stop the chat's active turn and ask the backend to stop generating.
    ///
    /// Returns whether a local turn was running.
    pub async fn stop(&self, chat_id: &str) -> bool {
        let chat_id = chat_key(chat_id);
        let stopped = self.sessions.stop(&chat_id);
        if let Err(e) = self.backend.stop_generation().await {
            warn!(chat_id = %chat_id, error = %e, "Backend stop request failed");
        }
        info!(chat_id = %chat_id, stopped, "Stop requested");
        stopped
    }

    /// Compress the chat's history now; the next turn sends the result.
    pub async fn compress_now(
        &self,
        chat_id: &str,
        draft: &str,
    ) -> Result<CompressionCandidate, TurnError> {
        Ok(self.guard.compress_now(&chat_key(chat_id), draft, &[]).await?)
    }

    /// Run one turn to completion, publishing progress on `events`.
    ///
    /// `events` is bounded; the caller must keep draining it.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<TurnEvent>,
    ) -> Result<TurnOutcome, TurnError> {
        let chat_id = chat_key(&request.chat_id);
        let message = request.message.trim().to_string();
        if message.is_empty() && request.attachments.is_empty() {
            return Err(TurnError::EmptyMessage);
        }

        let session = self.sessions.begin(&chat_id);
        if let Some(previous) = session.replaced() {
            self.settle_replaced(&chat_id, previous).await;
        }
        let model_id = self.guard.model_id();
        info!(chat_id = %chat_id, session = %session.id(), model = %model_id, "Turn started");

        self.apply_scenario(&model_id, &message).await;

        let plan = self
            .guard
            .prepare_request(&chat_id, &message, &request.attachments)
            .await?;
        if plan.still_overflows() && (plan.compressed || plan.not_compressible.is_some()) {
            warn!(
                chat_id = %chat_id,
                used_tokens = plan.usage.used_tokens,
                context_window = plan.usage.context_window,
                "Request does not fit the context window"
            );
            return Err(TurnError::overflow(&plan.usage));
        }

        let usage = plan.usage;
        let compression = AppliedCompression::from_plan(&plan);

        if !message.is_empty() {
            self.store
                .persist_turn(&chat_id, HistoryEntry::user(message.clone()).now())
                .await?;
        }
        let title = self.store.chat_title(&chat_id).await.unwrap_or_else(|e| {
            debug!(chat_id = %chat_id, error = %e, "No chat title");
            None
        });

        let mut chat_request = ChatRequest::new(message, chat_id.clone())
            .with_history(plan.history)
            .with_attachments(request.attachments)
            .with_model(model_id.clone());
        if let Some(title) = title {
            chat_request = chat_request.with_title(title);
        }

        let ctx = TurnContext {
            chat_id: &chat_id,
            model_id: &model_id,
            request: &chat_request,
            session: &session,
            events: &events,
            usage,
        };
        if let Some(compression) = &compression {
            ctx.emit(TurnEvent::Compressed(compression.clone())).await;
        }

        let mut progress = TurnProgress::default();
        let result = match self.stream_once(&ctx, &mut progress).await {
            Ok(StreamEnd::Done(reply)) => {
                if reply.text != progress.reconciler.text() && !reply.text.is_empty() {
                    ctx.emit(TurnEvent::Partial {
                        text: reply.text.clone(),
                    })
                    .await;
                }
                Ok(progress.outcome(reply, StreamMode::Streaming, None))
            }
            Ok(StreamEnd::Closed) if session.is_cancelled() => Ok(progress.partial(true)),
            Ok(StreamEnd::Closed) if !progress.reconciler.is_empty() => {
                warn!(chat_id = %chat_id, "Stream closed before done; keeping partial text");
                Ok(progress.partial(false))
            }
            Ok(StreamEnd::Closed) => Err(TurnError::EmptyStream),
            Err(error) => self.recover(error, &ctx, &progress).await,
        };
        self.guard.clear_pending_assistant_text();

        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "Turn failed");
                return Err(e);
            }
        };
        outcome.compression = compression;
        self.persist_reply(&chat_id, &outcome).await;

        info!(
            chat_id = %chat_id,
            mode = outcome.mode.as_str(),
            cancelled = outcome.cancelled,
            chars = outcome.text.chars().count(),
            "Turn finished"
        );
        Ok(outcome)
    }

    /// Stop the replaced turn and wait until it has persisted what it had.
    async fn settle_replaced(&self, chat_id: &str, previous: &GenerationSession) {
        if previous.is_finished() {
            return;
        }
        info!(chat_id = %chat_id, session = %previous.id(), "Stopping the running turn first");
        if let Err(e) = self.backend.stop_generation().await {
            warn!(chat_id = %chat_id, error = %e, "Backend stop request failed");
        }
        if tokio::time::timeout(REPLACED_TURN_WAIT, previous.finished())
            .await
            .is_err()
        {
            warn!(chat_id = %chat_id, session = %previous.id(), "Replaced turn did not finish in time");
        }
    }

    async fn apply_scenario(&self, model_id: &str, draft: &str) {
        if !self.auto_apply_scenario || model_id.is_empty() {
            return;
        }
        let budget = self.guard.refresh(false).await;
        let profile = self.scenario.resolve(draft);
        if self
            .tuner
            .apply(model_id, profile, Some(budget.model_context_limit))
            .await
            .is_err()
        {
            debug!(model = %model_id, profile = %profile, "Continuing without scenario parameters");
        }
    }

    /// Stream one reply, feeding deltas through the reconciler.
    async fn stream_once(
        &self,
        ctx: &TurnContext<'_>,
        progress: &mut TurnProgress,
    ) -> Result<StreamEnd, BackendError> {
        let token = ctx.session.token();
        let mut rx = self
            .backend
            .stream_chat(ctx.request.clone(), token.clone())
            .await?;

        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(BackendError::Aborted),
                item = rx.recv() => item,
            };
            let Some(item) = item else {
                return Ok(StreamEnd::Closed);
            };
            let event = item?;

            match &event {
                StreamEvent::Start(_) => {
                    if let Some(label) = event.model_label() {
                        progress.model = Some(label.to_string());
                        ctx.emit(TurnEvent::Model {
                            label: label.to_string(),
                        })
                        .await;
                    }
                }
                StreamEvent::Delta(_) => {
                    let Some(fragment) = event.delta_text() else {
                        continue;
                    };
                    if let Some(text) = progress.reconciler.push(fragment) {
                        let text = text.to_string();
                        ctx.session.set_latest_text(&text);
                        self.guard.set_pending_assistant_text(&text);
                        ctx.emit(TurnEvent::Partial { text }).await;
                    }
                }
                StreamEvent::ToolStart(payload) => {
                    ctx.emit(TurnEvent::Tool {
                        phase: ToolPhase::Start,
                        payload: payload.clone(),
                    })
                    .await;
                }
                StreamEvent::ToolResult(payload) => {
                    progress.tool_events.push(payload.clone());
                    ctx.emit(TurnEvent::Tool {
                        phase: ToolPhase::Result,
                        payload: payload.clone(),
                    })
                    .await;
                }
                StreamEvent::Status(_) => {
                    if let Some(message) = event.status_message() {
                        ctx.emit(TurnEvent::Status {
                            message: message.to_string(),
                        })
                        .await;
                    }
                }
                StreamEvent::Done(payload) => {
                    let reply = ChatReply::from_payload(payload, progress.reconciler.text())?;
                    return Ok(StreamEnd::Done(reply));
                }
                StreamEvent::Error(_) => {
                    return Err(BackendError::Generation(
                        event.error_message().unwrap_or_default(),
                    ));
                }
                StreamEvent::Other { name, .. } => {
                    debug!(event = %name, "Ignoring unknown stream event");
                }
            }
        }
    }

    // ── Recovery ──────────────────────────────────────────────────────────

    async fn recover(
        &self,
        error: BackendError,
        ctx: &TurnContext<'_>,
        progress: &TurnProgress,
    ) -> Result<TurnOutcome, TurnError> {
        if ctx.session.is_cancelled() {
            return Ok(progress.partial(true));
        }

        match self.classifier.classify(&error) {
            ErrorClass::Cancelled => Ok(progress.partial(true)),
            ErrorClass::ContextOverflow => Err(TurnError::overflow(&ctx.usage)),
            ErrorClass::Transport => {
                warn!(chat_id = %ctx.chat_id, error = %error, "Stream failed; retrying without streaming");
                ctx.emit(TurnEvent::Status {
                    message: "Stream unavailable, retrying without streaming".into(),
                })
                .await;
                let token = ctx.session.token();
                match send_cancellable(self.backend.as_ref(), ctx.request.clone(), &token).await {
                    Ok(reply) => {
                        self.replay(&reply, ctx).await;
                        Ok(progress.outcome(reply, StreamMode::NonStreaming, None))
                    }
                    Err(retry_error) => self.fall_back(retry_error, ctx, progress).await,
                }
            }
            ErrorClass::Resource(kind) => {
                debug!(chat_id = %ctx.chat_id, kind = ?kind, "Resource failure");
                self.fall_back(error, ctx, progress).await
            }
            ErrorClass::Other => self.degrade(error, ctx, progress),
        }
    }

    async fn fall_back(
        &self,
        error: BackendError,
        ctx: &TurnContext<'_>,
        progress: &TurnProgress,
    ) -> Result<TurnOutcome, TurnError> {
        if ctx.session.is_cancelled() || error.is_cancellation() {
            return Ok(progress.partial(true));
        }
        if !self.fallback.should_fallback(&error) {
            return self.degrade(error, ctx, progress);
        }

        ctx.emit(TurnEvent::Status {
            message: format!("Model {} failed, trying another model", ctx.model_id),
        })
        .await;

        let backend = self.backend.clone();
        let token = ctx.session.token();
        let result = self
            .fallback
            .run(ctx.model_id, error, |candidate| {
                let backend = backend.clone();
                let token = token.clone();
                let request = ctx.request.clone().with_model(candidate);
                async move { send_cancellable(backend.as_ref(), request, &token).await }
            })
            .await;

        match result {
            Ok(outcome) => {
                self.guard.set_model(&outcome.served_by);
                ctx.emit(TurnEvent::Model {
                    label: outcome.served_by.clone(),
                })
                .await;
                self.replay(&outcome.value, ctx).await;
                Ok(progress.outcome(
                    outcome.value,
                    StreamMode::FallbackModel,
                    Some(outcome.served_by),
                ))
            }
            Err(e) if e.is_cancellation() || ctx.session.is_cancelled() => {
                Ok(progress.partial(true))
            }
            Err(e) => self.degrade(e, ctx, progress),
        }
    }

    /// Last resort: keep whatever text arrived, or fail.
    fn degrade(
        &self,
        error: BackendError,
        ctx: &TurnContext<'_>,
        progress: &TurnProgress,
    ) -> Result<TurnOutcome, TurnError> {
        if self.classifier.classify(&error) == ErrorClass::ContextOverflow {
            return Err(TurnError::overflow(&ctx.usage));
        }
        if progress.reconciler.is_empty() {
            return Err(TurnError::Backend(error));
        }
        warn!(
            chat_id = %ctx.chat_id,
            error = %error,
            chars = progress.reconciler.text().chars().count(),
            "Generation failed; keeping partial text"
        );
        Ok(progress.partial(false))
    }

    /// Publish a non-streamed reply as if it had streamed: its text and
    /// one synthetic tool result per tool event.
    async fn replay(&self, reply: &ChatReply, ctx: &TurnContext<'_>) {
        for (i, event) in reply.tool_events.iter().enumerate() {
            let name = event
                .get("name")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or("tool");
            let status = event
                .get("status")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or("ok");
            ctx.emit(TurnEvent::Tool {
                phase: ToolPhase::Result,
                payload: json!({
                    "invocation_id": format!("fallback-{}", i + 1),
                    "name": name,
                    "status": status,
                    "output": event.get("output").cloned().unwrap_or(Value::Null),
                }),
            })
            .await;
        }
        if !reply.text.is_empty() {
            ctx.emit(TurnEvent::Partial {
                text: reply.text.clone(),
            })
            .await;
        }
    }

    async fn persist_reply(&self, chat_id: &str, outcome: &TurnOutcome) {
        if !outcome.text.trim().is_empty() {
            let entry = HistoryEntry::assistant(outcome.text.clone()).now();
            if let Err(e) = self.store.persist_turn(chat_id, entry).await {
                warn!(chat_id = %chat_id, error = %e, "Could not persist assistant reply");
            }
        }
        if let Some(title) = &outcome.chat_title {
            if let Err(e) = self.store.set_chat_title(chat_id, title).await {
                warn!(chat_id = %chat_id, error = %e, "Could not store chat title");
            }
        }
    }
}
