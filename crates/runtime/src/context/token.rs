//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token, counted on
//! the trimmed text. Good enough for a usage indicator and for choosing
//! between compression candidates; the backend does the exact accounting.

use tidewire_core::backend::MAX_ATTACHMENTS;
use tidewire_core::history::{MAX_ENTRY_CHARS, truncate_chars};
use tidewire_core::{Attachment, AttachmentKind, HistoryEntry};

/// Inlined attachment text beyond this many chars is not counted.
pub const ATTACHMENT_TEXT_CAP: usize = 3500;

/// Flat cost of an image attachment.
pub const IMAGE_TOKENS: u32 = 16;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters, rounded up, at least 1 for non-empty
/// text. Whitespace-only text is free.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.trim().chars().count();
    if chars == 0 {
        return 0;
    }
    chars.div_ceil(4).max(1) as u32
}

/// Estimate tokens for the retained history.
pub fn estimate_history_tokens(entries: &[HistoryEntry]) -> u32 {
    entries.iter().map(|e| estimate_tokens(&e.text)).sum()
}

/// Estimate tokens for a single attachment.
///
/// Inlined text counts its first [`ATTACHMENT_TEXT_CAP`] chars, images cost
/// [`IMAGE_TOKENS`], anything else is charged for its file name.
pub fn estimate_attachment_tokens(attachment: &Attachment) -> u32 {
    let text = attachment.text_content.trim();
    if !text.is_empty() {
        let capped: String = text.chars().take(ATTACHMENT_TEXT_CAP).collect();
        return estimate_tokens(&capped);
    }
    if attachment.kind == AttachmentKind::Image {
        return IMAGE_TOKENS;
    }
    estimate_tokens(&attachment.name)
}

/// Estimate tokens for the attachments that would be sent.
pub fn estimate_attachments_tokens(attachments: &[Attachment]) -> u32 {
    attachments
        .iter()
        .take(MAX_ATTACHMENTS)
        .map(estimate_attachment_tokens)
        .sum()
}

/// Normalize in-flight assistant text the way a history entry would be.
pub fn normalize_pending_text(text: &str) -> String {
    truncate_chars(text.trim(), MAX_ENTRY_CHARS)
}
