//! Incremental decoder for the `text/event-stream` body of `/chat/stream`.
//!
//! Frames are separated by a blank line. Inside a frame, `event:` names the
//! type (default `message`), `data:` lines carry the payload and are joined
//! with `\n`, and lines starting with `:` are comments. Byte chunks may split
//! frames, lines, `\r\n` pairs and UTF-8 sequences anywhere.

use serde_json::{Value, json};
use tidewire_core::StreamEvent;

/// Event name used when a frame has no `event:` line.
const DEFAULT_EVENT: &str = "message";

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: Value,
}

impl SseFrame {
    pub fn into_event(self) -> StreamEvent {
        StreamEvent::from_frame(&self.event, self.data)
    }
}

/// Parse a single frame. Returns `None` for frames without data lines.
///
/// A payload that is not valid JSON is wrapped as `{"raw": <text>}`.
pub fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = DEFAULT_EVENT.to_string();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(name) = line.strip_prefix("event:") {
            let name = name.trim();
            event = if name.is_empty() {
                DEFAULT_EVENT.to_string()
            } else {
                name.to_string()
            };
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.trim_start());
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    let raw = data_lines.join("\n");
    let data = serde_json::from_str(&raw).unwrap_or_else(|_| json!({ "raw": raw }));
    Some(SseFrame { event, data })
}

/// Buffers stream bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
    /// A chunk ended in `\r`; the next may start with the matching `\n`.
    trailing_cr: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body; returns every frame it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        let mut text = self.decode_utf8(bytes);
        if self.trailing_cr {
            text.insert(0, '\r');
            self.trailing_cr = false;
        }
        if text.ends_with('\r') {
            text.pop();
            self.trailing_cr = true;
        }
        self.buffer
            .push_str(&text.replace("\r\n", "\n").replace('\r', "\n"));

        let mut frames = Vec::new();
        while let Some(idx) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..idx + 2).collect();
            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush the unterminated tail at end of body.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.buffer.push_str(&rest);
        }
        self.trailing_cr = false;
        let tail = std::mem::take(&mut self.buffer);
        let tail = tail.trim();
        if tail.is_empty() {
            return None;
        }
        parse_block(tail)
    }

    fn decode_utf8(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let out = s.to_string();
                self.pending.clear();
                out
            }
            // Incomplete sequence at the end: keep it for the next chunk.
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                out
            }
            Err(_) => {
                let out = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_event() {
        let frame = parse_block("event: delta\ndata: {\"text\":\"Hi\"}").unwrap();
        assert_eq!(frame.event, "delta");
        assert_eq!(frame.data["text"], "Hi");
    }

    #[test]
    fn default_event_is_message() {
        let frame = parse_block("data: {}").unwrap();
        assert_eq!(frame.event, "message");
    }

    #[test]
    fn multiple_data_lines_are_joined() {
        let frame = parse_block("event: status\ndata: line one\ndata:line two").unwrap();
        assert_eq!(frame.data["raw"], "line one\nline two");
    }

    #[test]
    fn comments_and_dataless_blocks_are_skipped() {
        assert!(parse_block(": keep-alive").is_none());
        assert!(parse_block("event: ping").is_none());
    }

    #[test]
    fn invalid_json_is_wrapped_raw() {
        let frame = parse_block("event: delta\ndata: {broken").unwrap();
        assert_eq!(frame.data, json!({"raw": "{broken"}));
    }

    #[test]
    fn decoder_handles_split_chunks_and_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: delta\r\ndata: {\"te").is_empty());
        assert!(decoder.push(b"xt\":\"a\"}\r").is_empty());
        let frames = decoder.push(b"\n\r\nevent: done\r\ndata: {}\r\n\r\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data["text"], "a");
        assert_eq!(frames[1].event, "done");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn decoder_handles_split_utf8() {
        let bytes = "event: delta\ndata: {\"text\":\"héllo\"}\n\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        let frames = decoder.push(&bytes[split..]);
        assert_eq!(frames[0].data["text"], "héllo");
    }

    #[test]
    fn finish_dispatches_unterminated_tail() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: done\ndata: {\"reply\":\"x\"}\n").is_empty());
        let frame = decoder.finish().unwrap();
        assert_eq!(frame.event, "done");
        assert_eq!(frame.data["reply"], "x");
    }

    #[test]
    fn frames_convert_to_events() {
        let frame = parse_block("event: tool_result\ndata: {\"name\":\"search\"}").unwrap();
        assert!(matches!(frame.into_event(), StreamEvent::ToolResult(_)));
    }
}
