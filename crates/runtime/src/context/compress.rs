//! History compression.
//!
//! When a request would overflow the context window, the history is split
//! into a head (older turns) and a tail (the most recent turns, kept
//! verbatim). The head is either dropped or replaced by one synthetic
//! assistant turn holding an extractive summary: a handful of original
//! snippets picked by a relevance score, never a paraphrase.
//!
//! Candidates are generated from the gentlest reduction to the harshest and
//! evaluated with the same estimator the guard uses. The first candidate
//! that fits wins; otherwise the one with the lowest usage is returned if it
//! saves enough to be worth it.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Serialize;
use thiserror::Error;
use tidewire_core::{Attachment, ContextBudget, HistoryEntry, Role};
use tracing::debug;

use super::usage::{UsageInput, UsageSnapshot};

/// Summary length budgets, tried from the longest.
pub const SUMMARY_BUDGETS: [usize; 6] = [1200, 980, 760, 560, 420, 300];

/// Lower bound on any summary budget.
pub const MIN_SUMMARY_BUDGET: usize = 220;

/// Non-system turns to keep verbatim, tried from the most.
pub const KEEP_TAIL_OPTIONS: [usize; 5] = [6, 5, 4, 3, 2];

/// Tail sizes for the head-dropping pass.
const TAIL_ONLY_OPTIONS: [usize; 3] = [3, 2, 1];

pub const MAX_SUMMARY_ITEMS: usize = 9;

pub const SNIPPET_CHARS: usize = 220;

/// A candidate must save at least this much to be accepted.
pub const MIN_SAVED_TOKENS: u32 = 24;

const SUMMARY_HEADER: &str = "History auto-compressed. The system prompt was not changed.";
const SUMMARY_INTRO: &str = "Key fragments of the earlier conversation:";
const SUMMARY_FOOTER: &str = "The latest messages follow in full below.";

/// Text features that make a head turn worth quoting, with their weight.
const SCORE_RULES: &[(&str, f64)] = &[
    (r"\?", 12.0),
    (r"```|`[^`]+`", 10.0),
    (
        r"(?i)error|fail|bug|warning|todo|fix|urgent|asap|broken|crash|need|must|add",
        14.0,
    ),
    (
        r"(?i)https?://|/[\w.-]+\.[a-z]{2,}|\b[a-z0-9_./-]+\.(js|ts|py|rs|json|md|css|html|toml)\b",
        8.0,
    ),
    (r"\d", 4.0),
];

static SCORE_PATTERNS: LazyLock<Vec<(Regex, f64)>> = LazyLock::new(|| {
    SCORE_RULES
        .iter()
        .filter_map(|(pattern, weight)| Regex::new(pattern).ok().map(|re| (re, *weight)))
        .collect()
});

static CODE_BLOCK: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)```.*?```").ok());

const RECENCY_WEIGHT: f64 = 32.0;
const USER_WEIGHT: f64 = 28.0;
const ASSISTANT_WEIGHT: f64 = 14.0;
const LONG_TEXT_CHARS: usize = 240;
const LONG_TEXT_WEIGHT: f64 = 6.0;

// ── Types ─────────────────────────────────────────────────────────────────

/// How a candidate history was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Head replaced by an extractive summary turn.
    ExtractiveSummary,
    /// Head dropped.
    TailOnly,
    /// Only system turns and the last user turn survive.
    EmergencyLastUser,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtractiveSummary => "extractive-summary",
            Self::TailOnly => "tail-only",
            Self::EmergencyLastUser => "emergency-last-user",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reduced history and what it would cost.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionCandidate {
    pub history_override: Vec<HistoryEntry>,
    pub usage: UsageSnapshot,
    pub strategy: Strategy,
    pub source_messages: usize,
    pub target_messages: usize,
    pub saved_tokens: u32,
    pub resolved_overflow: bool,
}

/// Why no compression could be offered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotCompressible {
    #[error("history has {0} entries; nothing to compress")]
    TooShort(usize),

    #[error("no split of the history produced a candidate")]
    NoCandidates,

    #[error("best candidate saves {saved_tokens} tokens, below the 24 token minimum")]
    InsufficientSavings { saved_tokens: u32 },
}

/// What the compressor works on.
#[derive(Debug, Clone, Copy)]
pub struct CompressionInput<'a> {
    /// Retained history, already normalized.
    pub history: &'a [HistoryEntry],
    pub draft: &'a str,
    pub attachments: &'a [Attachment],
    pub budget: &'a ContextBudget,
}

// ── Compression ───────────────────────────────────────────────────────────

/// Find the best reduced history for `input`.
///
/// `baseline` is the usage of the uncompressed request; it is recomputed
/// when absent. The returned candidate always uses strictly fewer tokens
/// than the baseline and saves at least [`MIN_SAVED_TOKENS`].
pub fn compress_history(
    input: CompressionInput<'_>,
    baseline: Option<UsageSnapshot>,
) -> Result<CompressionCandidate, NotCompressible> {
    let history = input.history;
    if history.len() < 2 {
        return Err(NotCompressible::TooShort(history.len()));
    }

    let baseline = baseline.unwrap_or_else(|| estimate(&input, history));
    let candidates = build_candidates(history);
    if candidates.is_empty() {
        return Err(NotCompressible::NoCandidates);
    }

    let mut best: Option<CompressionCandidate> = None;
    for (strategy, override_history) in candidates {
        let usage = estimate(&input, &override_history);
        let improves = best
            .as_ref()
            .is_none_or(|b| usage.used_tokens < b.usage.used_tokens);
        let resolved_overflow = !usage.overflowed();
        let saved_tokens = baseline.used_tokens.saturating_sub(usage.used_tokens);
        if improves {
            best = Some(CompressionCandidate {
                source_messages: history.len(),
                target_messages: override_history.len(),
                history_override: override_history,
                saved_tokens,
                usage,
                strategy,
                resolved_overflow,
            });
        }
        if resolved_overflow && saved_tokens >= MIN_SAVED_TOKENS {
            break;
        }
    }

    let Some(best) = best else {
        return Err(NotCompressible::NoCandidates);
    };
    if best.saved_tokens < MIN_SAVED_TOKENS || best.usage.used_tokens >= baseline.used_tokens {
        debug!(
            saved_tokens = best.saved_tokens,
            strategy = %best.strategy,
            "Compression rejected"
        );
        return Err(NotCompressible::InsufficientSavings {
            saved_tokens: best.saved_tokens,
        });
    }

    debug!(
        strategy = %best.strategy,
        source = best.source_messages,
        target = best.target_messages,
        saved_tokens = best.saved_tokens,
        resolved = best.resolved_overflow,
        "Compression candidate selected"
    );
    Ok(best)
}

fn estimate(input: &CompressionInput<'_>, history: &[HistoryEntry]) -> UsageSnapshot {
    UsageSnapshot::estimate(
        input.budget,
        UsageInput {
            history,
            draft: input.draft,
            attachments: input.attachments,
            pending_assistant: "",
        },
    )
}

/// All distinct candidate histories, gentlest first.
fn build_candidates(history: &[HistoryEntry]) -> Vec<(Strategy, Vec<HistoryEntry>)> {
    let mut candidates = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |strategy: Strategy, entries: Vec<HistoryEntry>| {
        if entries.is_empty() {
            return;
        }
        if seen.insert(signature(&entries)) {
            candidates.push((strategy, entries));
        }
    };

    for keep_tail in KEEP_TAIL_OPTIONS {
        let Some(split) = usable_split(history, keep_tail) else {
            continue;
        };
        let head_dialog: Vec<&HistoryEntry> = history[..split]
            .iter()
            .filter(|e| e.role != Role::System)
            .collect();
        if head_dialog.is_empty() {
            continue;
        }
        for budget in SUMMARY_BUDGETS {
            let summary = build_extractive_summary(&head_dialog, budget);
            if summary.is_empty() {
                continue;
            }
            push(
                Strategy::ExtractiveSummary,
                assemble(history, split, Some(summary)),
            );
        }
        push(Strategy::TailOnly, assemble(history, split, None));
    }

    for keep_tail in TAIL_ONLY_OPTIONS {
        if let Some(split) = usable_split(history, keep_tail) {
            push(Strategy::TailOnly, assemble(history, split, None));
        }
    }

    if let Some(last_user) = history.iter().rev().find(|e| e.role == Role::User) {
        let mut emergency: Vec<HistoryEntry> = history
            .iter()
            .filter(|e| e.role == Role::System)
            .cloned()
            .collect();
        emergency.push(last_user.clone());
        push(Strategy::EmergencyLastUser, emergency);
    }

    candidates
}

fn signature(entries: &[HistoryEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}\u{1f}{}", e.role, e.text))
        .collect::<Vec<_>>()
        .join("\u{1e}")
}

/// Index where the tail of `keep_tail` non-system turns begins.
///
/// Returns 0 when the history has fewer non-system turns than that.
pub fn tail_start_index(history: &[HistoryEntry], keep_tail: usize) -> usize {
    let required = keep_tail.max(1);
    let mut seen = 0;
    for (index, entry) in history.iter().enumerate().rev() {
        if entry.role != Role::System {
            seen += 1;
            if seen >= required {
                return index;
            }
        }
    }
    0
}

fn usable_split(history: &[HistoryEntry], keep_tail: usize) -> Option<usize> {
    let split = tail_start_index(history, keep_tail);
    (split > 0 && split < history.len()).then_some(split)
}

/// Head system turns, then the optional summary, then the tail.
fn assemble(history: &[HistoryEntry], split: usize, summary: Option<String>) -> Vec<HistoryEntry> {
    let (head, tail) = history.split_at(split);
    let mut out: Vec<HistoryEntry> = head
        .iter()
        .filter(|e| e.role == Role::System)
        .cloned()
        .collect();
    if let Some(summary) = summary {
        out.push(HistoryEntry::assistant(summary));
    }
    out.extend_from_slice(tail);
    out
}

// ── Extractive summary ────────────────────────────────────────────────────

/// Collapse whitespace, replace fenced code with `[code]` and cap the length.
pub fn summary_snippet(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let replaced = match CODE_BLOCK.as_ref() {
        Some(re) => re.replace_all(&collapsed, "[code]").into_owned(),
        None => collapsed,
    };
    let safe = replaced.trim();
    if safe.is_empty() {
        return String::new();
    }
    if safe.chars().count() > max_chars {
        let kept: String = safe.chars().take(max_chars.saturating_sub(1)).collect();
        return format!("{}…", kept.trim_end());
    }
    safe.to_string()
}

/// Relevance of the head turn at `index` out of `total`.
pub fn score_entry(entry: &HistoryEntry, index: usize, total: usize) -> f64 {
    let recency = if total > 0 {
        index as f64 / total as f64
    } else {
        0.0
    };
    let mut score = recency * RECENCY_WEIGHT;
    score += match entry.role {
        Role::User => USER_WEIGHT,
        Role::Assistant => ASSISTANT_WEIGHT,
        Role::System => 0.0,
    };
    for (pattern, weight) in SCORE_PATTERNS.iter() {
        if pattern.is_match(&entry.text) {
            score += weight;
        }
    }
    if entry.text.chars().count() > LONG_TEXT_CHARS {
        score += LONG_TEXT_WEIGHT;
    }
    score
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
    }
}

/// Build a summary of `head` no longer than `max_chars` (at least 220).
///
/// The first user turn, the last user turn and the last assistant turn
/// always lead; the remaining slots go to the best-scoring turns.
pub fn build_extractive_summary(head: &[&HistoryEntry], max_chars: usize) -> String {
    let entries: Vec<&HistoryEntry> = head
        .iter()
        .copied()
        .filter(|e| e.role != Role::System)
        .collect();
    if entries.is_empty() {
        return String::new();
    }

    let mut selected: Vec<(Role, String)> = Vec::new();
    let mut keys = HashSet::new();
    let mut pick = |entry: Option<&HistoryEntry>, selected: &mut Vec<(Role, String)>| {
        let Some(entry) = entry else { return };
        let snippet = summary_snippet(&entry.text, SNIPPET_CHARS);
        if snippet.is_empty() {
            return;
        }
        if keys.insert(format!("{}:{}", entry.role, snippet.to_lowercase())) {
            selected.push((entry.role, snippet));
        }
    };

    pick(entries.iter().copied().find(|e| e.role == Role::User), &mut selected);
    pick(entries.iter().rev().copied().find(|e| e.role == Role::User), &mut selected);
    pick(entries.iter().rev().copied().find(|e| e.role == Role::Assistant), &mut selected);

    let total = entries.len();
    let mut ranked: Vec<(f64, &HistoryEntry)> = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| (score_entry(entry, index, total), *entry))
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

    for (_, entry) in ranked {
        if selected.len() >= MAX_SUMMARY_ITEMS {
            break;
        }
        pick(Some(entry), &mut selected);
    }

    let mut lines: Vec<String> = vec![SUMMARY_HEADER.into(), SUMMARY_INTRO.into()];
    lines.extend(
        selected
            .iter()
            .take(MAX_SUMMARY_ITEMS)
            .map(|(role, snippet)| format!("- {}: {snippet}", role_label(*role))),
    );
    lines.push(SUMMARY_FOOTER.into());

    let budget = max_chars.max(MIN_SUMMARY_BUDGET);
    // Drop items from the end, keeping header, intro and footer.
    while lines.len() > 3 && lines.join("\n").chars().count() > budget {
        lines.remove(lines.len() - 2);
    }

    let summary = lines.join("\n").trim().to_string();
    if summary.chars().count() > budget {
        let kept: String = summary.chars().take(budget - 1).collect();
        return format!("{}…", kept.trim_end());
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn near_cap_history(count: usize) -> Vec<HistoryEntry> {
        (0..count)
            .map(|i| {
                let body = format!("turn {i}: {}", "lorem ipsum dolor sit amet ".repeat(60));
                let text: String = body.chars().take(1_390).collect();
                if i % 2 == 0 {
                    HistoryEntry::user(text)
                } else {
                    HistoryEntry::assistant(text)
                }
            })
            .collect()
    }

    fn input<'a>(history: &'a [HistoryEntry], budget: &'a ContextBudget) -> CompressionInput<'a> {
        CompressionInput {
            history,
            draft: "what next?",
            attachments: &[],
            budget,
        }
    }

    #[test]
    fn tail_start_skips_system_entries() {
        let history = vec![
            HistoryEntry::system("rules"),
            HistoryEntry::user("a"),
            HistoryEntry::assistant("b"),
            HistoryEntry::system("note"),
            HistoryEntry::user("c"),
        ];
        assert_eq!(tail_start_index(&history, 2), 2);
        assert_eq!(tail_start_index(&history, 3), 1);
        assert_eq!(tail_start_index(&history, 6), 0);
    }

    #[test]
    fn snippet_collapses_whitespace_and_code() {
        let snippet = summary_snippet("see\n\n```rust\nfn main() {}\n```  now", 220);
        assert_eq!(snippet, "see [code] now");
    }

    #[test]
    fn snippet_is_truncated() {
        let snippet = summary_snippet(&"word ".repeat(100), 220);
        assert_eq!(snippet.chars().count(), 220);
        assert!(snippet.ends_with('…'));
    }

    #[test]
    fn questions_and_errors_score_higher() {
        let plain = HistoryEntry::assistant("okay");
        let urgent = HistoryEntry::user("why does main.rs fail with error 42?");
        assert!(score_entry(&urgent, 0, 4) > score_entry(&plain, 3, 4));
        assert_eq!(score_entry(&plain, 0, 4), 14.0);
        assert_eq!(score_entry(&urgent, 0, 4), 28.0 + 12.0 + 14.0 + 8.0 + 4.0);
    }

    #[test]
    fn summary_leads_with_anchor_turns() {
        let head = [
            HistoryEntry::user("first question"),
            HistoryEntry::assistant("first answer"),
            HistoryEntry::user("second question"),
            HistoryEntry::assistant("second answer"),
        ];
        let refs: Vec<&HistoryEntry> = head.iter().collect();
        let summary = build_extractive_summary(&refs, 1200);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines[0], SUMMARY_HEADER);
        assert_eq!(lines[2], "- User: first question");
        assert_eq!(lines[3], "- User: second question");
        assert_eq!(lines[4], "- Assistant: second answer");
        assert_eq!(lines[5], "- Assistant: first answer");
        assert_eq!(lines.last().copied(), Some(SUMMARY_FOOTER));
        assert_eq!(lines.len(), 7);
    }

    #[test]
    fn summary_respects_budget() {
        let history = near_cap_history(12);
        let refs: Vec<&HistoryEntry> = history.iter().collect();
        for budget in SUMMARY_BUDGETS {
            let summary = build_extractive_summary(&refs, budget);
            assert!(summary.chars().count() <= budget, "budget {budget}");
            assert!(summary.starts_with(SUMMARY_HEADER));
        }
        let tiny = build_extractive_summary(&refs, 10);
        assert!(tiny.chars().count() <= MIN_SUMMARY_BUDGET);
    }

    #[test]
    fn summary_caps_item_count() {
        let history: Vec<HistoryEntry> = (0..30)
            .map(|i| HistoryEntry::user(format!("distinct message {i}")))
            .collect();
        let refs: Vec<&HistoryEntry> = history.iter().collect();
        let summary = build_extractive_summary(&refs, 5_000);
        let items = summary.lines().filter(|l| l.starts_with("- ")).count();
        assert_eq!(items, MAX_SUMMARY_ITEMS);
    }

    #[test]
    fn overflowing_history_is_compressed() {
        let history = near_cap_history(24);
        let budget = ContextBudget {
            context_window: 4096,
            ..ContextBudget::default()
        };
        let baseline = estimate(&input(&history, &budget), &history);
        assert!(baseline.overflowed());

        let candidate = compress_history(input(&history, &budget), Some(baseline)).unwrap();
        assert!(candidate.resolved_overflow);
        assert!(candidate.target_messages < candidate.source_messages);
        assert!(candidate.usage.used_tokens < baseline.used_tokens);
        assert!(candidate.saved_tokens >= MIN_SAVED_TOKENS);
        assert_eq!(candidate.strategy, Strategy::ExtractiveSummary);
        assert_eq!(candidate.history_override.last(), history.last());
    }

    #[test]
    fn head_system_entries_survive() {
        let mut history = vec![HistoryEntry::system("house rules")];
        history.extend(near_cap_history(12));
        let budget = ContextBudget {
            context_window: 2048,
            ..ContextBudget::default()
        };
        let candidate = compress_history(input(&history, &budget), None).unwrap();
        assert_eq!(candidate.history_override[0], HistoryEntry::system("house rules"));
    }

    #[test]
    fn falls_back_to_harsher_candidates() {
        let history = near_cap_history(24);
        let budget = ContextBudget {
            context_window: 900,
            ..ContextBudget::default()
        };
        let candidate = compress_history(input(&history, &budget), None).unwrap();
        assert!(candidate.target_messages <= 3);
        assert!(candidate.resolved_overflow);
    }

    #[test]
    fn best_effort_when_nothing_fits() {
        let history = near_cap_history(24);
        let budget = ContextBudget {
            context_window: 512,
            ..ContextBudget::default()
        };
        let baseline = estimate(&input(&history, &budget), &history);
        let candidate = compress_history(input(&history, &budget), Some(baseline)).unwrap();
        assert!(!candidate.resolved_overflow);
        assert!(candidate.usage.used_tokens < baseline.used_tokens);
    }

    #[test]
    fn short_history_is_not_compressible() {
        let history = vec![HistoryEntry::user("only one")];
        let budget = ContextBudget::default();
        assert_eq!(
            compress_history(input(&history, &budget), None),
            Err(NotCompressible::TooShort(1))
        );
    }

    #[test]
    fn tiny_savings_are_rejected() {
        let history = vec![
            HistoryEntry::user("hi"),
            HistoryEntry::assistant("hello"),
            HistoryEntry::user("how are you"),
        ];
        let budget = ContextBudget::default();
        let result = compress_history(input(&history, &budget), None);
        assert!(matches!(
            result,
            Err(NotCompressible::InsufficientSavings { .. })
        ));
    }

    #[test]
    fn never_returns_a_costlier_history() {
        for count in 2..24 {
            let history = near_cap_history(count);
            let budget = ContextBudget {
                context_window: 1024,
                ..ContextBudget::default()
            };
            let baseline = estimate(&input(&history, &budget), &history);
            if let Ok(candidate) = compress_history(input(&history, &budget), Some(baseline)) {
                assert!(candidate.usage.used_tokens < baseline.used_tokens);
            }
        }
    }
}
