//! Backend trait: the abstraction over the inference server.
//!
//! A Backend knows how to run one chat generation, either as a stream of
//! [`StreamEvent`]s or as a single reply, and how to manage the model the
//! server has selected.
//!
//! Implementations: the HTTP backend in `tidewire-backend`, scripted mocks
//! in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::BackendError;
use crate::history::HistoryEntry;
use crate::model::{ContextRequirements, ModelCatalog, ModelParams};
use crate::stream::StreamEvent;

/// Receiving half of a generation stream.
pub type EventReceiver = mpsc::Receiver<Result<StreamEvent, BackendError>>;

/// Chat id used when the caller has none.
pub const DEFAULT_CHAT_ID: &str = "default";

/// Maximum attachments considered per request.
pub const MAX_ATTACHMENTS: usize = 10;

// ── Request ─────────────────────────────────────────────────────────────

/// Kind of a user attachment. Unknown kinds are treated as `File`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum AttachmentKind {
    #[default]
    File,
    Image,
    Text,
    Document,
    Audio,
    Video,
}

impl From<String> for AttachmentKind {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" => Self::Image,
            "text" => Self::Text,
            "document" => Self::Document,
            "audio" => Self::Audio,
            "video" => Self::Video,
            _ => Self::File,
        }
    }
}

/// A file the user attached to the draft.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub kind: AttachmentKind,

    #[serde(default)]
    pub mime_type: String,

    #[serde(default)]
    pub size: u64,

    /// Inlined text content, if the file was readable as text.
    #[serde(default)]
    pub text_content: String,

    #[serde(default)]
    pub data_url: String,
}

impl Attachment {
    pub fn text(name: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            name: name.into(),
            kind: AttachmentKind::Text,
            mime_type: "text/plain".into(),
            size: content.len() as u64,
            text_content: content,
            ..Self::default()
        }
    }

    pub fn image(name: impl Into<String>, data_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AttachmentKind::Image,
            data_url: data_url.into(),
            ..Self::default()
        }
    }
}

/// UI-side settings forwarded with every request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiContext {
    #[serde(default)]
    pub model_id: String,
}

/// Conversation context sent alongside the message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatContext {
    pub chat_id: String,

    #[serde(default)]
    pub chat_title: String,

    #[serde(default)]
    pub ui: UiContext,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Body of `POST /chat` and `POST /chat/stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,

    #[serde(default)]
    pub attachments: Vec<Attachment>,

    pub context: ChatContext,
}

impl ChatRequest {
    /// Start a request for `chat_id`; an empty id becomes `"default"`.
    pub fn new(message: impl Into<String>, chat_id: impl Into<String>) -> Self {
        let chat_id = chat_id.into();
        let chat_id = if chat_id.trim().is_empty() {
            DEFAULT_CHAT_ID.to_string()
        } else {
            chat_id
        };
        Self {
            message: message.into(),
            attachments: Vec::new(),
            context: ChatContext {
                chat_id,
                ..ChatContext::default()
            },
        }
    }

    pub fn with_history(mut self, history: Vec<HistoryEntry>) -> Self {
        self.context.history = history;
        self
    }

    /// Attach files; only the first [`MAX_ATTACHMENTS`] are kept.
    pub fn with_attachments(mut self, mut attachments: Vec<Attachment>) -> Self {
        attachments.truncate(MAX_ATTACHMENTS);
        self.attachments = attachments;
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.context.ui.model_id = model_id.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.context.chat_title = title.into();
        self
    }

    pub fn chat_id(&self) -> &str {
        &self.context.chat_id
    }
}

// ── Reply ───────────────────────────────────────────────────────────────

/// How a reply reached the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Token stream completed normally.
    Streaming,
    /// Served by the non-streaming endpoint.
    NonStreaming,
    /// Stream broke after some text arrived; the partial text is the reply.
    PartialStream,
    /// Served by a different model after a resource failure.
    FallbackModel,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::NonStreaming => "non_streaming",
            Self::PartialStream => "partial_stream",
            Self::FallbackModel => "fallback_model",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "streaming" => Some(Self::Streaming),
            "non_streaming" | "non-streaming" => Some(Self::NonStreaming),
            "partial_stream" => Some(Self::PartialStream),
            "fallback_model" => Some(Self::FallbackModel),
            _ => None,
        }
    }
}

/// A normalized assistant reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_events: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_mode: Option<StreamMode>,
}

fn first_text<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

impl ChatReply {
    /// Normalize a `done` payload or a `/chat` response body.
    ///
    /// A bare JSON string is the reply text. Objects are read through their
    /// field aliases; `fallback_text` fills in when no text field is set.
    /// Any other shape is rejected.
    pub fn from_payload(payload: &Value, fallback_text: &str) -> Result<Self, BackendError> {
        match payload {
            Value::String(text) => Ok(Self {
                text: text.clone(),
                ..Self::default()
            }),
            Value::Object(_) => {
                let text = ["reply", "message", "output", "result"]
                    .iter()
                    .filter_map(|key| payload.get(*key).and_then(Value::as_str))
                    .find(|s| !s.is_empty())
                    .unwrap_or(fallback_text)
                    .to_string();

                let tool_events = ["tool_events", "toolEvents"]
                    .iter()
                    .filter_map(|key| payload.get(*key).and_then(Value::as_array))
                    .next()
                    .cloned()
                    .unwrap_or_default();

                let stream_mode = payload
                    .get("stream")
                    .and_then(|s| s.get("mode"))
                    .and_then(Value::as_str)
                    .and_then(StreamMode::parse);

                Ok(Self {
                    text,
                    model: first_text(payload, &["model", "model_name", "modelLabel", "model_label"])
                        .map(str::to_string),
                    chat_title: first_text(payload, &["chat_title", "chatTitle"]).map(str::to_string),
                    mood: first_text(payload, &["mood"]).map(str::to_lowercase),
                    tool_events,
                    stream_mode,
                })
            }
            other => Err(BackendError::Decode(format!(
                "unexpected reply shape: {}",
                match other {
                    Value::Null => "null",
                    Value::Bool(_) => "bool",
                    Value::Number(_) => "number",
                    Value::Array(_) => "array",
                    _ => "unknown",
                }
            ))),
        }
    }

    /// Render the reply as the `done` payload the stream would carry.
    pub fn to_done_payload(&self) -> Value {
        let mut payload = serde_json::json!({ "reply": self.text });
        if let Some(model) = &self.model {
            payload["model"] = Value::String(model.clone());
        }
        if let Some(title) = &self.chat_title {
            payload["chat_title"] = Value::String(title.clone());
        }
        if !self.tool_events.is_empty() {
            payload["tool_events"] = Value::Array(self.tool_events.clone());
        }
        payload["stream"] = serde_json::json!({
            "mode": self.stream_mode.unwrap_or(StreamMode::NonStreaming).as_str()
        });
        payload
    }
}

// ── Trait ───────────────────────────────────────────────────────────────

/// The core Backend trait.
///
/// The runtime calls `stream_chat()` or `send_chat()` without knowing which
/// transport is in use.
#[async_trait]
pub trait Backend: Send + Sync {
    /// A human-readable name for this backend.
    fn name(&self) -> &str;

    /// Run one generation and get a complete reply (`POST /chat`).
    async fn send_chat(&self, request: ChatRequest) -> Result<ChatReply, BackendError>;

    /// Run one generation as a stream of events (`POST /chat/stream`).
    ///
    /// Cancelling `cancel` aborts the request and surfaces
    /// [`BackendError::Aborted`]. The default implementation calls
    /// `send_chat()` and wraps the reply as a single `done` event.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<EventReceiver, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Aborted);
        }
        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Aborted),
            reply = self.send_chat(request) => reply?,
        };
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Ok(StreamEvent::Done(reply.to_done_payload()))).await;
        Ok(rx)
    }

    /// Ask the server to stop the generation it is running (`POST /chat/stop`).
    async fn stop_generation(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Fetch the model catalog (`GET /models`).
    async fn list_models(&self) -> Result<ModelCatalog, BackendError> {
        Ok(ModelCatalog::default())
    }

    /// Make `model_id` the active model (`POST /models/select`), loading it
    /// into memory right away when `load` is set.
    async fn select_model(&self, model_id: &str, _load: bool) -> Result<(), BackendError> {
        Err(BackendError::NotConfigured(format!(
            "Backend '{}' cannot select model '{model_id}'",
            self.name()
        )))
    }

    /// Context-window requirements of `model_id`.
    async fn context_requirements(
        &self,
        model_id: &str,
    ) -> Result<ContextRequirements, BackendError>;

    /// Health check: can we reach the backend?
    async fn health_check(&self) -> Result<bool, BackendError> {
        Ok(true)
    }

    /// Persist generation parameters for `model_id`.
    async fn update_model_params(
        &self,
        model_id: &str,
        _params: &ModelParams,
    ) -> Result<(), BackendError> {
        Err(BackendError::NotConfigured(format!(
            "Backend '{}' cannot update params for '{model_id}'",
            self.name()
        )))
    }
}
