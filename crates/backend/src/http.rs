//! HTTP backend for the local inference server.
//!
//! Supports:
//! - Streaming generation over `POST /chat/stream` (server-push events)
//! - Non-streaming generation over `POST /chat`
//! - Stopping the running generation
//! - Model catalog, selection, context requirements and parameters
//!
//! Every request has a hard timeout. Streams additionally honour a
//! [`CancellationToken`]; cancellation is reported as
//! [`BackendError::Aborted`], never as a timeout.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde_json::{Value, json};
use tidewire_config::BackendConfig;
use tidewire_core::backend::EventReceiver;
use tidewire_core::{
    Backend, BackendError, ChatReply, ChatRequest, ContextRequirements, ModelCatalog, ModelParams,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::sse::SseDecoder;

/// Per-endpoint hard timeouts.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Catalog, selection and other short requests.
    pub request: Duration,
    /// A whole generation, streaming or not.
    pub stream: Duration,
    pub stop: Duration,
    pub params: Duration,
    pub requirements: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_millis(12_000),
            stream: Duration::from_millis(300_000),
            stop: Duration::from_millis(8_000),
            params: Duration::from_millis(30_000),
            requirements: Duration::from_millis(20_000),
        }
    }
}

impl From<&BackendConfig> for Timeouts {
    fn from(config: &BackendConfig) -> Self {
        Self {
            request: config.request_timeout(),
            stream: config.stream_timeout(),
            stop: config.stop_timeout(),
            params: config.params_timeout(),
            requirements: config.requirements_timeout(),
        }
    }
}

/// Backend that talks to the inference server over HTTP.
pub struct HttpBackend {
    name: String,
    base_url: String,
    api_key: Option<String>,
    timeouts: Timeouts,
    client: reqwest::Client,
}

impl HttpBackend {
    /// Create a backend for `base_url`.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, BackendError> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(BackendError::NotConfigured("backend URL is empty".into()));
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| BackendError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: "http".into(),
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeouts: Timeouts::default(),
            client,
        })
    }

    /// Create a backend from the `[backend]` config section.
    pub fn from_config(config: &BackendConfig) -> Result<Self, BackendError> {
        Ok(Self::new(&config.base_url, config.api_key.clone())?.with_timeouts(Timeouts::from(config)))
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send a JSON request and decode a JSON (or text) body.
    async fn request_json(
        &self,
        builder: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<Value, BackendError> {
        let fut = async {
            let response = self
                .authorize(builder)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            let status = response.status();
            let payload = read_payload(response).await?;
            if !status.is_success() {
                let detail = describe_error_payload(&payload);
                warn!(status = status.as_u16(), detail = %detail, "Backend returned error");
                return Err(BackendError::Http {
                    status: status.as_u16(),
                    detail,
                });
            }
            Ok(payload)
        };

        tokio::time::timeout(timeout, fut).await.map_err(|_| {
            BackendError::Timeout(format!("no response within {}ms", timeout.as_millis()))
        })?
    }
}

/// Read a body as JSON when it parses, otherwise as a JSON string.
async fn read_payload(response: reqwest::Response) -> Result<Value, BackendError> {
    let text = response.text().await.map_err(map_reqwest_error)?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

fn map_reqwest_error(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else {
        BackendError::Network(error.to_string())
    }
}

/// Human-readable detail of an error body.
///
/// Order: a bare string, `message`, `detail` (string, then `detail.message`,
/// then `detail` as JSON), finally the whole payload as JSON.
pub fn describe_error_payload(payload: &Value) -> String {
    match payload {
        Value::Null => "empty response".into(),
        Value::String(s) => s.clone(),
        _ => {
            if let Some(message) = payload
                .get("message")
                .and_then(Value::as_str)
                .filter(|m| !m.trim().is_empty())
            {
                return message.to_string();
            }
            match payload.get("detail") {
                Some(Value::String(detail)) => detail.clone(),
                Some(Value::Null) | None => payload.to_string(),
                Some(detail) => detail
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| detail.to_string()),
            }
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_chat(&self, request: ChatRequest) -> Result<ChatReply, BackendError> {
        debug!(chat_id = %request.chat_id(), "Sending chat request");
        let payload = self
            .request_json(
                self.client.post(self.url("/chat")).json(&request),
                self.timeouts.stream,
            )
            .await?;
        ChatReply::from_payload(&payload, "")
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<EventReceiver, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Aborted);
        }

        let deadline = Instant::now() + self.timeouts.stream;
        let timeout_ms = self.timeouts.stream.as_millis();

        debug!(chat_id = %request.chat_id(), "Opening generation stream");

        let send = self
            .authorize(self.client.post(self.url("/chat/stream")))
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .json(&request)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Aborted),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(BackendError::Timeout(format!("stream not opened within {timeout_ms}ms")));
            }
            response = send => response.map_err(map_reqwest_error)?,
        };

        let status = response.status();
        if !status.is_success() {
            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackendError::Aborted),
                payload = read_payload(response) => payload.unwrap_or(Value::Null),
            };
            let detail = describe_error_payload(&payload);
            warn!(status = status.as_u16(), detail = %detail, "Stream request rejected");
            return Err(BackendError::Http {
                status: status.as_u16(),
                detail,
            });
        }

        let (tx, rx) = mpsc::channel(64);

        // Spawn task to read the event stream and forward decoded frames
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(BackendError::Aborted)).await;
                        return;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        let _ = tx
                            .send(Err(BackendError::Timeout(format!(
                                "stream did not finish within {timeout_ms}ms"
                            ))))
                            .await;
                        return;
                    }
                    next = byte_stream.next() => next,
                };

                match next {
                    Some(Ok(bytes)) => {
                        for frame in decoder.push(&bytes) {
                            let event = frame.into_event();
                            trace!(event = %event.event_type(), "Stream frame");
                            let terminal = event.is_terminal();
                            if tx.send(Ok(event)).await.is_err() {
                                return; // receiver dropped
                            }
                            if terminal {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(BackendError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                    None => {
                        if let Some(frame) = decoder.finish() {
                            let _ = tx.send(Ok(frame.into_event())).await;
                        }
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn stop_generation(&self) -> Result<(), BackendError> {
        self.request_json(
            self.client.post(self.url("/chat/stop")).json(&json!({})),
            self.timeouts.stop,
        )
        .await
        .map(|_| ())
    }

    async fn list_models(&self) -> Result<ModelCatalog, BackendError> {
        let payload = self
            .request_json(self.client.get(self.url("/models")), self.timeouts.request)
            .await?;
        serde_json::from_value(payload).map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn select_model(&self, model_id: &str, load: bool) -> Result<(), BackendError> {
        debug!(model = %model_id, load, "Selecting model");
        self.request_json(
            self.client
                .post(self.url("/models/select"))
                .json(&json!({ "model_id": model_id, "load": load })),
            self.timeouts.request,
        )
        .await
        .map(|_| ())
    }

    async fn context_requirements(
        &self,
        model_id: &str,
    ) -> Result<ContextRequirements, BackendError> {
        let payload = self
            .request_json(
                self.client
                    .get(self.url("/models/context-requirements"))
                    .query(&[("model_id", model_id)]),
                self.timeouts.requirements,
            )
            .await?;
        serde_json::from_value(payload).map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn update_model_params(
        &self,
        model_id: &str,
        params: &ModelParams,
    ) -> Result<(), BackendError> {
        let path = format!("/models/{}/params", urlencoding::encode(model_id.trim()));
        self.request_json(
            self.client.patch(self.url(&path)).json(params),
            self.timeouts.params,
        )
        .await
        .map(|_| ())
    }

    async fn health_check(&self) -> Result<bool, BackendError> {
        self.request_json(
            self.client.get(self.url("/health")),
            Duration::from_secs(5),
        )
        .await
        .map(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_trims_base_url() {
        let backend = HttpBackend::new("http://localhost:5055/ ", None).unwrap();
        assert_eq!(backend.base_url(), "http://localhost:5055");
        assert_eq!(backend.url("/chat"), "http://localhost:5055/chat");
    }

    #[test]
    fn empty_url_is_not_configured() {
        assert!(matches!(
            HttpBackend::new("  ", None),
            Err(BackendError::NotConfigured(_))
        ));
    }

    #[test]
    fn timeouts_follow_config() {
        let mut config = BackendConfig::default();
        config.stream_timeout_ms = 1_000;
        let timeouts = Timeouts::from(&config);
        assert_eq!(timeouts.stream, Duration::from_secs(1));
        assert_eq!(timeouts.request, Duration::from_secs(12));
    }

    #[test]
    fn error_detail_order() {
        assert_eq!(describe_error_payload(&json!("plain")), "plain");
        assert_eq!(
            describe_error_payload(&json!({"message": "m", "detail": "d"})),
            "m"
        );
        assert_eq!(
            describe_error_payload(&json!({"message": "  ", "detail": "d"})),
            "d"
        );
        assert_eq!(
            describe_error_payload(&json!({"detail": {"message": "nested"}})),
            "nested"
        );
        assert_eq!(
            describe_error_payload(&json!({"detail": [{"loc": "body"}]})),
            r#"[{"loc":"body"}]"#
        );
        assert_eq!(describe_error_payload(&json!({"code": 1})), r#"{"code":1}"#);
    }
}
