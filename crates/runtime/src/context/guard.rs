//! Context window guard.
//!
//! Keeps the active model's [`ContextBudget`] fresh, estimates how much of
//! the window the next request would use, and compresses the history when it
//! would not fit. Usage snapshots are published on a `watch` channel so a
//! UI (or the CLI) can show an indicator without polling.
//!
//! Budget refreshes are debounced, skipped while the cached budget is fresh
//! for the same model, and single-flight: concurrent callers wait for one
//! outstanding fetch instead of issuing their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tidewire_config::ContextGuardConfig;
use tidewire_core::history::MAX_HISTORY_ENTRIES;
use tidewire_core::{Attachment, Backend, ChatStore, ContextBudget, HistoryEntry, StoreError};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::compress::{CompressionCandidate, CompressionInput, NotCompressible, compress_history};
use super::token::normalize_pending_text;
use super::usage::{UsageInput, UsageSnapshot};

/// Ledger entries kept per chat.
pub const MAX_COMPRESSION_LAYERS: usize = 120;

/// A failed budget fetch is not retried for the same model within this window.
const FAILED_FETCH_BACKOFF: Duration = Duration::from_secs(5);

/// Guard tuning, usually taken from `[context_guard]`.
#[derive(Debug, Clone, Copy)]
pub struct GuardSettings {
    pub enabled: bool,
    pub auto_compress: bool,
    pub stale_after: Duration,
    pub refresh_debounce: Duration,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self::from(&ContextGuardConfig::default())
    }
}

impl From<&ContextGuardConfig> for GuardSettings {
    fn from(config: &ContextGuardConfig) -> Self {
        Self {
            enabled: config.enabled,
            auto_compress: config.auto_compress,
            stale_after: config.stale_after(),
            refresh_debounce: config.refresh_debounce(),
        }
    }
}

/// How the next reply of a chat treats its history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NextReplyMode {
    /// Compress only when the request overflows.
    #[default]
    Auto,
    /// Compress even when the request fits.
    Compressed,
    /// Never compress.
    Full,
}

impl NextReplyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Compressed => "compressed",
            Self::Full => "full",
        }
    }

    /// Unknown values fall back to `Auto`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "compressed" => Self::Compressed,
            "full" => Self::Full,
            _ => Self::Auto,
        }
    }

    /// auto → compressed → full → auto.
    pub fn next(self) -> Self {
        match self {
            Self::Auto => Self::Compressed,
            Self::Compressed => Self::Full,
            Self::Full => Self::Auto,
        }
    }
}

impl std::fmt::Display for NextReplyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied compression, kept in the per-chat ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionLayer {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub strategy: String,
    pub source_messages: usize,
    pub target_messages: usize,
    pub saved_tokens: u32,
    pub resolved_overflow: bool,
    pub before: UsageSnapshot,
    pub after: UsageSnapshot,
    /// Applied without an overflow (forced override or `compressed` mode).
    pub forced: bool,
}

/// Ledger totals for one chat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionSummary {
    pub layers: usize,
    pub total_saved_tokens: u64,
    pub last_layer: Option<CompressionLayer>,
    pub next_reply_mode: NextReplyMode,
    pub has_pending_override: bool,
}

/// What `prepare_request` decided for one outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestPlan {
    /// Usage of the request as it will be sent.
    pub usage: UsageSnapshot,
    /// Usage before compression, when compression was applied.
    pub previous_usage: Option<UsageSnapshot>,
    pub overflowed: bool,
    pub compressed: bool,
    /// History to send: the override when compressed, else the full window.
    pub history: Vec<HistoryEntry>,
    pub strategy: Option<String>,
    pub source_messages: usize,
    pub target_messages: usize,
    pub saved_tokens: u32,
    pub resolved_overflow: bool,
    pub forced: bool,
    pub next_reply_mode: NextReplyMode,
    /// Why compression was attempted and rejected.
    #[serde(skip)]
    pub not_compressible: Option<NotCompressible>,
}

impl RequestPlan {
    fn uncompressed(usage: UsageSnapshot, history: Vec<HistoryEntry>, mode: NextReplyMode) -> Self {
        Self {
            overflowed: usage.overflowed(),
            resolved_overflow: !usage.overflowed(),
            source_messages: history.len(),
            target_messages: history.len(),
            usage,
            previous_usage: None,
            compressed: false,
            history,
            strategy: None,
            saved_tokens: 0,
            forced: false,
            next_reply_mode: mode,
            not_compressible: None,
        }
    }

    /// The request still does not fit after everything the guard tried.
    pub fn still_overflows(&self) -> bool {
        self.usage.overflowed()
    }
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("History cannot be compressed: {0}")]
    NotCompressible(#[from] NotCompressible),
}

/// A compression stashed by `compress_now` for the next request.
#[derive(Debug, Clone)]
struct ForcedOverride {
    history: Vec<HistoryEntry>,
    strategy: String,
    source_messages: usize,
    target_messages: usize,
}

#[derive(Debug, Default)]
struct GuardState {
    model_id: String,
    budget: ContextBudget,
    budget_model: Option<String>,
    fetched_at: Option<Instant>,
    failed_at: Option<Instant>,
    fetches: u64,
    draft: String,
    attachments: Vec<Attachment>,
    pending_assistant: String,
    last_history: Vec<HistoryEntry>,
    modes: HashMap<String, NextReplyMode>,
    layers: HashMap<String, Vec<CompressionLayer>>,
    overrides: HashMap<String, ForcedOverride>,
}

impl GuardState {
    fn is_fresh(&self, stale_after: Duration) -> bool {
        if self.budget_model.as_deref() != Some(self.model_id.as_str()) {
            return false;
        }
        if self
            .failed_at
            .is_some_and(|at| at.elapsed() < FAILED_FETCH_BACKOFF)
        {
            return true;
        }
        self.fetched_at.is_some_and(|at| at.elapsed() < stale_after)
    }

    fn estimate(&self, history: &[HistoryEntry], pending: &str) -> UsageSnapshot {
        UsageSnapshot::estimate(
            &self.budget,
            UsageInput {
                history,
                draft: &self.draft,
                attachments: &self.attachments,
                pending_assistant: pending,
            },
        )
    }
}

struct GuardInner {
    backend: Arc<dyn Backend>,
    store: Arc<dyn ChatStore>,
    settings: GuardSettings,
    /// Non-async, held briefly; never across an await.
    state: Mutex<GuardState>,
    /// Serializes budget fetches.
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped on every debounced refresh request.
    refresh_generation: AtomicU64,
    usage_tx: watch::Sender<UsageSnapshot>,
}

/// Shared handle to the guard. Cloning is cheap.
#[derive(Clone)]
pub struct ContextGuard {
    inner: Arc<GuardInner>,
}

fn chat_key(chat_id: &str) -> String {
    let trimmed = chat_id.trim();
    if trimmed.is_empty() {
        tidewire_core::backend::DEFAULT_CHAT_ID.to_string()
    } else {
        trimmed.to_string()
    }
}

impl ContextGuard {
    pub fn new(
        backend: Arc<dyn Backend>,
        store: Arc<dyn ChatStore>,
        settings: GuardSettings,
    ) -> Self {
        let (usage_tx, _) = watch::channel(UsageSnapshot::default());
        Self {
            inner: Arc::new(GuardInner {
                backend,
                store,
                settings,
                state: Mutex::new(GuardState::default()),
                refresh_lock: tokio::sync::Mutex::new(()),
                refresh_generation: AtomicU64::new(0),
                usage_tx,
            }),
        }
    }

    /// Start tracking `model_id`.
    pub fn with_model(self, model_id: impl Into<String>) -> Self {
        self.state().model_id = model_id.into().trim().to_string();
        self
    }

    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> GuardSettings {
        self.inner.settings
    }

    pub fn model_id(&self) -> String {
        self.state().model_id.clone()
    }

    /// Switch to `model_id`; a change schedules a budget refresh.
    pub fn set_model(&self, model_id: &str) {
        let changed = {
            let mut state = self.state();
            let model_id = model_id.trim();
            if state.model_id == model_id {
                false
            } else {
                state.model_id = model_id.to_string();
                true
            }
        };
        if changed && self.inner.settings.enabled {
            self.schedule_refresh();
        }
    }

    /// The cached budget.
    pub fn budget(&self) -> ContextBudget {
        self.state().budget
    }

    /// Number of budget fetches issued so far.
    pub fn fetch_count(&self) -> u64 {
        self.state().fetches
    }

    /// Latest published usage.
    pub fn latest_usage(&self) -> UsageSnapshot {
        *self.inner.usage_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UsageSnapshot> {
        self.inner.usage_tx.subscribe()
    }

    /// Usage updates as a stream, starting with the current value.
    pub fn usage_stream(&self) -> WatchStream<UsageSnapshot> {
        WatchStream::new(self.subscribe())
    }

    fn publish(&self, usage: UsageSnapshot) {
        self.inner.usage_tx.send_replace(usage);
    }

    // ── Budget refresh ────────────────────────────────────────────────────

    /// Make sure the budget is fresh for the active model.
    ///
    /// Skipped when fresh unless `force` is set. Callers that arrive while a
    /// fetch is running wait for it and reuse its result.
    pub async fn refresh(&self, force: bool) -> ContextBudget {
        if !self.inner.settings.enabled {
            return self.budget();
        }
        let (observed, fresh) = {
            let state = self.state();
            (state.fetches, state.is_fresh(self.inner.settings.stale_after))
        };
        if fresh && !force {
            return self.budget();
        }

        let _flight = self.inner.refresh_lock.lock().await;
        let model_id = {
            let state = self.state();
            if state.fetches != observed {
                // Another caller fetched while we waited.
                return state.budget;
            }
            if !force && state.is_fresh(self.inner.settings.stale_after) {
                return state.budget;
            }
            state.model_id.clone()
        };

        debug!(model = %model_id, "Refreshing context budget");
        let result = self.inner.backend.context_requirements(&model_id).await;

        let mut state = self.state();
        state.fetches += 1;
        match result {
            Ok(payload) => {
                state.budget = state.budget.apply(&payload);
                state.budget_model = Some(model_id.clone());
                state.fetched_at = Some(Instant::now());
                state.failed_at = None;
                info!(
                    model = %model_id,
                    context_window = state.budget.context_window,
                    reserve = state.budget.reserve_tokens,
                    "Context budget updated"
                );
            }
            Err(e) => {
                warn!(model = %model_id, error = %e, "Context budget refresh failed");
                state.budget_model = Some(model_id);
                state.failed_at = Some(Instant::now());
            }
        }
        state.budget
    }

    /// Coalesce rapid refresh triggers into one fetch after a quiet period.
    pub fn schedule_refresh(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let generation = self.inner.refresh_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = self.clone();
        let delay = self.inner.settings.refresh_debounce;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if guard.inner.refresh_generation.load(Ordering::SeqCst) == generation {
                guard.refresh(false).await;
            }
        });
    }

    // ── Usage ─────────────────────────────────────────────────────────────

    async fn load_history(&self, chat_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        self.inner
            .store
            .active_history(chat_id, MAX_HISTORY_ENTRIES)
            .await
    }

    /// Recompute and publish usage for the current draft.
    ///
    /// Does no network I/O; a stale budget only schedules a debounced
    /// refresh.
    pub async fn sync(&self, chat_id: &str, draft: &str, attachments: &[Attachment]) -> UsageSnapshot {
        let history = match self.load_history(&chat_key(chat_id)).await {
            Ok(history) => history,
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "History unavailable for usage estimate");
                Vec::new()
            }
        };

        let (usage, stale) = {
            let mut state = self.state();
            state.draft = draft.to_string();
            state.attachments = attachments.to_vec();
            let pending = state.pending_assistant.clone();
            let usage = state.estimate(&history, &pending);
            state.last_history = history;
            (usage, !state.is_fresh(self.inner.settings.stale_after))
        };

        if stale && self.inner.settings.enabled {
            self.schedule_refresh();
        }
        self.publish(usage);
        usage
    }

    /// Record in-flight assistant text so the indicator accounts for it.
    pub fn set_pending_assistant_text(&self, text: &str) -> UsageSnapshot {
        let usage = {
            let mut state = self.state();
            let normalized = normalize_pending_text(text);
            if normalized == state.pending_assistant {
                return self.latest_usage();
            }
            state.pending_assistant = normalized;
            state.estimate(&state.last_history, &state.pending_assistant)
        };
        self.publish(usage);
        usage
    }

    pub fn clear_pending_assistant_text(&self) -> UsageSnapshot {
        self.set_pending_assistant_text("")
    }

    // ── Request preparation ───────────────────────────────────────────────

    /// Ensure the budget is fresh, estimate the request and compress the
    /// history when the chat's mode and the overflow call for it.
    pub async fn prepare_request(
        &self,
        chat_id: &str,
        draft: &str,
        attachments: &[Attachment],
    ) -> Result<RequestPlan, GuardError> {
        let chat_id = chat_key(chat_id);
        let mode = self.next_reply_mode(&chat_id);

        self.refresh(false).await;
        let history = self.load_history(&chat_id).await?;

        let usage = {
            let mut state = self.state();
            state.draft = draft.to_string();
            state.attachments = attachments.to_vec();
            state.pending_assistant.clear();
            state.last_history = history.clone();
            state.estimate(&history, "")
        };
        self.publish(usage);

        let settings = self.inner.settings;
        if !settings.enabled || mode == NextReplyMode::Full {
            return Ok(RequestPlan::uncompressed(usage, history, mode));
        }

        let forced = self.state().overrides.remove(&chat_id);
        if let Some(forced) = forced {
            let forced_usage = self.state().estimate(&forced.history, "");
            if forced_usage.used_tokens < usage.used_tokens {
                let saved_tokens = usage.used_tokens - forced_usage.used_tokens;
                self.record_layer(
                    &chat_id,
                    CompressionLayer {
                        id: Uuid::new_v4(),
                        created_at: Utc::now(),
                        strategy: forced.strategy.clone(),
                        source_messages: forced.source_messages,
                        target_messages: forced.target_messages,
                        saved_tokens,
                        resolved_overflow: !forced_usage.overflowed(),
                        before: usage,
                        after: forced_usage,
                        forced: true,
                    },
                );
                self.publish(forced_usage);
                info!(chat_id = %chat_id, saved_tokens, "Applied stashed compression");
                return Ok(RequestPlan {
                    usage: forced_usage,
                    previous_usage: Some(usage),
                    overflowed: usage.overflowed(),
                    compressed: true,
                    history: forced.history,
                    strategy: Some(forced.strategy),
                    source_messages: forced.source_messages,
                    target_messages: forced.target_messages,
                    saved_tokens,
                    resolved_overflow: !forced_usage.overflowed(),
                    forced: true,
                    next_reply_mode: mode,
                    not_compressible: None,
                });
            }
            debug!(chat_id = %chat_id, "Stashed compression no longer helps; dropped");
        }

        let overflowed = usage.overflowed();
        let attempt = if overflowed {
            settings.auto_compress
        } else {
            mode == NextReplyMode::Compressed
        };
        if !attempt {
            return Ok(RequestPlan::uncompressed(usage, history, mode));
        }

        let budget = self.budget();
        let result = compress_history(
            CompressionInput {
                history: &history,
                draft,
                attachments,
                budget: &budget,
            },
            Some(usage),
        );
        let candidate = match result {
            Ok(candidate) => candidate,
            Err(reason) => {
                if overflowed {
                    warn!(chat_id = %chat_id, reason = %reason, "Overflowing history not compressible");
                }
                let mut plan = RequestPlan::uncompressed(usage, history, mode);
                plan.not_compressible = Some(reason);
                return Ok(plan);
            }
        };

        self.apply_candidate(&chat_id, usage, &candidate, !overflowed);
        Ok(RequestPlan {
            usage: candidate.usage,
            previous_usage: Some(usage),
            overflowed,
            compressed: true,
            strategy: Some(candidate.strategy.to_string()),
            source_messages: candidate.source_messages,
            target_messages: candidate.target_messages,
            saved_tokens: candidate.saved_tokens,
            resolved_overflow: candidate.resolved_overflow,
            history: candidate.history_override,
            forced: !overflowed,
            next_reply_mode: mode,
            not_compressible: None,
        })
    }

    fn apply_candidate(
        &self,
        chat_id: &str,
        before: UsageSnapshot,
        candidate: &CompressionCandidate,
        forced: bool,
    ) {
        self.record_layer(
            chat_id,
            CompressionLayer {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                strategy: candidate.strategy.to_string(),
                source_messages: candidate.source_messages,
                target_messages: candidate.target_messages,
                saved_tokens: candidate.saved_tokens,
                resolved_overflow: candidate.resolved_overflow,
                before,
                after: candidate.usage,
                forced,
            },
        );
        self.publish(candidate.usage);
        info!(
            chat_id = %chat_id,
            strategy = %candidate.strategy,
            source = candidate.source_messages,
            target = candidate.target_messages,
            saved_tokens = candidate.saved_tokens,
            "History compressed"
        );
    }

    /// Compress the chat's history right away and stash the result for the
    /// next request.
    pub async fn compress_now(
        &self,
        chat_id: &str,
        draft: &str,
        attachments: &[Attachment],
    ) -> Result<CompressionCandidate, GuardError> {
        let chat_id = chat_key(chat_id);
        self.refresh(true).await;
        let history = self.load_history(&chat_id).await?;

        let (usage, budget) = {
            let mut state = self.state();
            state.draft = draft.to_string();
            state.attachments = attachments.to_vec();
            state.last_history = history.clone();
            (state.estimate(&history, ""), state.budget)
        };

        let candidate = compress_history(
            CompressionInput {
                history: &history,
                draft,
                attachments,
                budget: &budget,
            },
            Some(usage),
        )?;

        self.state().overrides.insert(
            chat_id.clone(),
            ForcedOverride {
                history: candidate.history_override.clone(),
                strategy: candidate.strategy.to_string(),
                source_messages: candidate.source_messages,
                target_messages: candidate.target_messages,
            },
        );
        self.publish(candidate.usage);
        info!(
            chat_id = %chat_id,
            strategy = %candidate.strategy,
            saved_tokens = candidate.saved_tokens,
            "Compression stashed for the next reply"
        );
        Ok(candidate)
    }

    // ── Reply mode and ledger ─────────────────────────────────────────────

    pub fn next_reply_mode(&self, chat_id: &str) -> NextReplyMode {
        self.state()
            .modes
            .get(&chat_key(chat_id))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_next_reply_mode(&self, chat_id: &str, mode: NextReplyMode) -> NextReplyMode {
        let mut state = self.state();
        let key = chat_key(chat_id);
        if mode == NextReplyMode::Auto {
            state.modes.remove(&key);
        } else {
            state.modes.insert(key, mode);
        }
        mode
    }

    pub fn cycle_next_reply_mode(&self, chat_id: &str) -> NextReplyMode {
        let next = self.next_reply_mode(chat_id).next();
        self.set_next_reply_mode(chat_id, next)
    }

    fn record_layer(&self, chat_id: &str, layer: CompressionLayer) {
        let mut state = self.state();
        let layers = state.layers.entry(chat_key(chat_id)).or_default();
        layers.push(layer);
        if layers.len() > MAX_COMPRESSION_LAYERS {
            let excess = layers.len() - MAX_COMPRESSION_LAYERS;
            layers.drain(..excess);
        }
    }

    pub fn compression_layers(&self, chat_id: &str) -> Vec<CompressionLayer> {
        self.state()
            .layers
            .get(&chat_key(chat_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn compression_summary(&self, chat_id: &str) -> CompressionSummary {
        let key = chat_key(chat_id);
        let state = self.state();
        let layers = state.layers.get(&key).map(Vec::as_slice).unwrap_or_default();
        CompressionSummary {
            layers: layers.len(),
            total_saved_tokens: layers.iter().map(|l| u64::from(l.saved_tokens)).sum(),
            last_layer: layers.last().cloned(),
            next_reply_mode: state.modes.get(&key).copied().unwrap_or_default(),
            has_pending_override: state.overrides.contains_key(&key),
        }
    }

    /// Forget the chat's ledger, stashed override and reply mode.
    pub fn clear_compression(&self, chat_id: &str) {
        let key = chat_key(chat_id);
        let mut state = self.state();
        state.layers.remove(&key);
        state.overrides.remove(&key);
        state.modes.remove(&key);
    }
}
