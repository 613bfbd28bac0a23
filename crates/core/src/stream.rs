//! Typed server-push events emitted by the generation stream.
//!
//! The backend names each frame (`start`, `delta`, `tool_start`,
//! `tool_result`, `status`, `done`, `error`) and attaches a JSON payload.
//! Unknown names are preserved as [`StreamEvent::Other`] so callers can
//! ignore them without losing the frame.

use serde::Serialize;
use serde_json::Value;

/// Fallback text when an `error` frame carries nothing usable.
const UNKNOWN_STREAM_ERROR: &str = "unknown stream error";

/// A single decoded frame from `/chat/stream`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Generation accepted; may name the serving model.
    Start(Value),

    /// A text fragment. Fragments may overlap previous ones.
    Delta(Value),

    /// A tool invocation began.
    ToolStart(Value),

    /// A tool invocation finished.
    ToolResult(Value),

    /// Progress note from the backend.
    Status(Value),

    /// Terminal success frame carrying the normalized reply.
    Done(Value),

    /// Terminal failure frame.
    Error(Value),

    /// A frame with an event name this client does not know.
    Other { name: String, payload: Value },
}

impl StreamEvent {
    /// Build an event from a frame's event name and decoded payload.
    pub fn from_frame(name: &str, payload: Value) -> Self {
        match name {
            "start" => Self::Start(payload),
            "delta" => Self::Delta(payload),
            "tool_start" => Self::ToolStart(payload),
            "tool_result" => Self::ToolResult(payload),
            "status" => Self::Status(payload),
            "done" => Self::Done(payload),
            "error" => Self::Error(payload),
            other => Self::Other {
                name: other.to_string(),
                payload,
            },
        }
    }

    /// SSE event name for this event type.
    pub fn event_type(&self) -> &str {
        match self {
            Self::Start(_) => "start",
            Self::Delta(_) => "delta",
            Self::ToolStart(_) => "tool_start",
            Self::ToolResult(_) => "tool_result",
            Self::Status(_) => "status",
            Self::Done(_) => "done",
            Self::Error(_) => "error",
            Self::Other { name, .. } => name,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Self::Start(p)
            | Self::Delta(p)
            | Self::ToolStart(p)
            | Self::ToolResult(p)
            | Self::Status(p)
            | Self::Done(p)
            | Self::Error(p) => p,
            Self::Other { payload, .. } => payload,
        }
    }

    /// `done` and `error` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error(_))
    }

    /// Text carried by a `delta` frame, if any.
    pub fn delta_text(&self) -> Option<&str> {
        match self {
            Self::Delta(p) => p.get("text").and_then(Value::as_str).filter(|t| !t.is_empty()),
            _ => None,
        }
    }

    /// Model label announced by a `start` frame.
    pub fn model_label(&self) -> Option<&str> {
        match self {
            Self::Start(p) => ["model_label", "model"]
                .iter()
                .filter_map(|key| p.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .find(|s| !s.is_empty()),
            _ => None,
        }
    }

    /// Trimmed message of a `status` frame.
    pub fn status_message(&self) -> Option<&str> {
        match self {
            Self::Status(p) => p
                .get("message")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty()),
            _ => None,
        }
    }

    /// Human-readable message of an `error` frame.
    ///
    /// Prefers `message`, then `detail`, then the raw payload as JSON.
    pub fn error_message(&self) -> Option<String> {
        let Self::Error(p) = self else {
            return None;
        };
        let text = match p {
            Value::Null => UNKNOWN_STREAM_ERROR.to_string(),
            Value::String(s) => s.clone(),
            other => ["message", "detail"]
                .iter()
                .filter_map(|key| other.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .find(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        };
        Some(text)
    }
}
