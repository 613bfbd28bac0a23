//! Delta reconciliation.
//!
//! The backend may resend text that fully or partially overlaps what was
//! already delivered (retries, duplicate frames, cumulative snapshots). The
//! reconciler keeps one growing string and only ever appends the part of an
//! incoming fragment that is genuinely new.

/// Compute the new suffix that `incoming` contributes to `accumulated`.
///
/// Rules, in order:
/// 1. `incoming` extends `accumulated` → the part after that prefix.
/// 2. `accumulated` already ends with `incoming` → nothing. Matches deeper
///    inside the text are real repeated tokens and are kept.
/// 3. The longest suffix of `accumulated` that is a prefix of `incoming`
///    is stripped from `incoming`.
/// 4. Otherwise `incoming` is entirely new.
///
/// Overlaps are measured on `char` boundaries.
pub fn resolve_delta<'a>(accumulated: &str, incoming: &'a str) -> &'a str {
    if incoming.is_empty() {
        return "";
    }
    if accumulated.is_empty() {
        return incoming;
    }
    if let Some(rest) = incoming.strip_prefix(accumulated) {
        return rest;
    }
    if accumulated.ends_with(incoming) {
        return "";
    }

    // Longest overlap first; candidate split points are char boundaries of
    // `incoming` no longer than `accumulated`.
    let max_overlap = accumulated.len().min(incoming.len());
    let boundaries = incoming
        .char_indices()
        .map(|(i, _)| i)
        .skip(1)
        .chain(std::iter::once(incoming.len()))
        .filter(|&i| i <= max_overlap);
    let mut best = 0;
    for end in boundaries {
        if accumulated.ends_with(&incoming[..end]) {
            best = end;
        }
    }
    &incoming[best..]
}

/// Accumulates reconciled text for one generation.
#[derive(Debug, Clone, Default)]
pub struct DeltaReconciler {
    text: String,
    deltas: usize,
}

impl DeltaReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delta; returns the full text when it grew.
    pub fn push(&mut self, incoming: &str) -> Option<&str> {
        let addition = resolve_delta(&self.text, incoming);
        if addition.is_empty() {
            return None;
        }
        self.text.push_str(addition);
        self.deltas += 1;
        Some(&self.text)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of deltas that contributed new text.
    pub fn applied(&self) -> usize {
        self.deltas
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn into_text(self) -> String {
        self.text
    }
}
