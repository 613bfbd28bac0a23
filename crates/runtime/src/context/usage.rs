//! Usage snapshots: how much of the context window a request would take.

use serde::Serialize;
use tidewire_core::model::{MAX_CONTEXT_WINDOW, MIN_CONTEXT_WINDOW};
use tidewire_core::{Attachment, ContextBudget, HistoryEntry};

use super::token::{
    estimate_attachments_tokens, estimate_history_tokens, estimate_tokens, normalize_pending_text,
};

/// Estimated context usage for one prospective request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageSnapshot {
    /// Always at least 1.
    pub used_tokens: u32,
    pub context_window: u32,
    /// `used / window`, clamped to `[0, 2]`.
    pub ratio: f64,
    /// Negative when the request overflows.
    pub remaining: i64,
    pub history_tokens: u32,
    pub draft_tokens: u32,
    pub attachment_tokens: u32,
    pub pending_assistant_tokens: u32,
    pub baseline_tokens: u32,
}

impl Default for UsageSnapshot {
    fn default() -> Self {
        Self::baseline(&ContextBudget::default())
    }
}

/// What a request is made of, for estimation.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageInput<'a> {
    pub history: &'a [HistoryEntry],
    pub draft: &'a str,
    pub attachments: &'a [Attachment],
    pub pending_assistant: &'a str,
}

impl UsageSnapshot {
    /// Usage of an empty request: the budget's baseline alone.
    pub fn baseline(budget: &ContextBudget) -> Self {
        Self::estimate(budget, UsageInput::default())
    }

    /// Estimate usage of `input` against `budget`.
    pub fn estimate(budget: &ContextBudget, input: UsageInput<'_>) -> Self {
        let history_tokens = estimate_history_tokens(input.history);
        let draft_tokens = estimate_tokens(input.draft);
        let attachment_tokens = estimate_attachments_tokens(input.attachments);
        let pending_assistant_tokens =
            estimate_tokens(&normalize_pending_text(input.pending_assistant));
        let baseline_tokens = budget.baseline_tokens();

        let used_tokens = baseline_tokens
            .saturating_add(history_tokens)
            .saturating_add(draft_tokens)
            .saturating_add(attachment_tokens)
            .saturating_add(pending_assistant_tokens)
            .max(1);
        let context_window = clamp_window(budget.context_window);
        let ratio = (f64::from(used_tokens) / f64::from(context_window)).clamp(0.0, 2.0);

        Self {
            used_tokens,
            context_window,
            ratio,
            remaining: i64::from(context_window) - i64::from(used_tokens),
            history_tokens,
            draft_tokens,
            attachment_tokens,
            pending_assistant_tokens,
            baseline_tokens,
        }
    }

    pub fn overflowed(&self) -> bool {
        self.used_tokens > self.context_window
    }

    /// Usage as a whole percentage, for display.
    pub fn percent(&self) -> u32 {
        (self.ratio * 100.0).round() as u32
    }
}

fn clamp_window(window: u32) -> u32 {
    window.clamp(MIN_CONTEXT_WINDOW, MAX_CONTEXT_WINDOW)
}
