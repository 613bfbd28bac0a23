//! Conversation history entries and the limits applied before they are
//! sent to the backend.
//!
//! The backend receives a compact window of the conversation: at most
//! [`MAX_HISTORY_ENTRIES`] entries, each capped at [`MAX_ENTRY_CHARS`]
//! characters, with at most [`MAX_HISTORY_CHARS`] characters in total.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of entries retained for a request.
pub const MAX_HISTORY_ENTRIES: usize = 24;

/// Maximum characters of a single entry.
pub const MAX_ENTRY_CHARS: usize = 1400;

/// Maximum characters across all retained entries.
pub const MAX_HISTORY_CHARS: usize = 18_000;

/// Smallest history limit a caller may ask for.
const MIN_HISTORY_LIMIT: usize = 2;

/// The role of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The assistant
    Assistant,
    /// System instructions
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    /// Parse a wire role name; unknown roles (e.g. `tool`) yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single persisted conversation turn, as sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,

    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Stamp the entry with the current time.
    pub fn now(self) -> Self {
        self.with_timestamp(Utc::now())
    }
}

/// Truncate `text` to at most `max_chars` characters.
///
/// Over-long text keeps its first `max_chars - 1` characters, right-trimmed,
/// followed by `…`.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(1);
    let mut out: String = text.chars().take(keep).collect();
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    out.push('…');
    out
}

/// Build the history window sent to the backend.
///
/// Takes the last `limit` entries (clamped to `[2, 24]`), drops empty ones,
/// truncates each to [`MAX_ENTRY_CHARS`], then walks from newest to oldest
/// keeping entries while the running total stays within
/// [`MAX_HISTORY_CHARS`]. At least one entry survives once any exists.
pub fn normalize_history(entries: &[HistoryEntry], limit: usize) -> Vec<HistoryEntry> {
    let limit = limit.clamp(MIN_HISTORY_LIMIT, MAX_HISTORY_ENTRIES);
    let start = entries.len().saturating_sub(limit);

    let mut compact = Vec::new();
    let mut total_chars = 0usize;

    for entry in entries[start..].iter().rev() {
        let text = entry.text.trim();
        if text.is_empty() {
            continue;
        }
        let text = truncate_chars(text, MAX_ENTRY_CHARS);
        let projected = total_chars + text.chars().count();
        if projected > MAX_HISTORY_CHARS && !compact.is_empty() {
            break;
        }
        total_chars = projected;
        compact.push(HistoryEntry {
            role: entry.role,
            text,
            timestamp: entry.timestamp,
        });
    }

    compact.reverse();
    compact
}
