//! HTTP backend tests against a mock inference server.

use std::time::Duration;

use serde_json::json;
use tidewire_backend::{HttpBackend, Timeouts};
use tidewire_core::{Backend, BackendError, ChatRequest, ModelParams, StreamEvent};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/event-stream")
}

async fn collect(
    mut rx: tidewire_core::backend::EventReceiver,
) -> Vec<Result<StreamEvent, BackendError>> {
    let mut out = Vec::new();
    while let Some(item) = rx.recv().await {
        out.push(item);
    }
    out
}

#[tokio::test]
async fn stream_yields_events_until_done() {
    let server = MockServer::start().await;
    let body = "event: start\ndata: {\"model\":\"qwen\"}\n\n\
                : keep-alive\n\n\
                event: delta\ndata: {\"text\":\"Hel\"}\n\n\
                event: delta\ndata: {\"text\":\"Hello\"}\n\n\
                event: done\ndata: {\"reply\":\"Hello\"}\n\n\
                event: delta\ndata: {\"text\":\"ignored\"}\n\n";
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .and(header("accept", "text/event-stream"))
        .and(header("cache-control", "no-cache"))
        .and(body_partial_json(json!({"message": "hi", "context": {"chat_id": "c1"}})))
        .respond_with(sse(body))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri(), None).unwrap();
    let rx = backend
        .stream_chat(ChatRequest::new("hi", "c1"), CancellationToken::new())
        .await
        .unwrap();
    let events: Vec<StreamEvent> = collect(rx).await.into_iter().map(Result::unwrap).collect();

    let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(kinds, vec!["start", "delta", "delta", "done"]);
    assert_eq!(events[0].model_label(), Some("qwen"));
    assert_eq!(events[2].delta_text(), Some("Hello"));
}

#[tokio::test]
async fn stream_error_event_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(sse(
            "event: delta\ndata: {\"text\":\"pa\"}\n\nevent: error\ndata: {\"message\":\"boom\"}\n\nevent: done\ndata: {}\n\n",
        ))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri(), None).unwrap();
    let rx = backend
        .stream_chat(ChatRequest::new("hi", "c1"), CancellationToken::new())
        .await
        .unwrap();
    let events = collect(rx).await;
    assert_eq!(events.len(), 2);
    let last = events[1].as_ref().unwrap();
    assert_eq!(last.error_message().as_deref(), Some("boom"));
}

#[tokio::test]
async fn unterminated_tail_is_dispatched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(sse("event: done\ndata: {\"reply\":\"tail\"}"))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri(), None).unwrap();
    let rx = backend
        .stream_chat(ChatRequest::new("hi", "c1"), CancellationToken::new())
        .await
        .unwrap();
    let events = collect(rx).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], Ok(StreamEvent::Done(_))));
}

#[tokio::test]
async fn http_error_carries_status_and_detail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(
            ResponseTemplate::new(503).set_body_json(json!({"detail": {"message": "model is loading"}})),
        )
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri(), None).unwrap();
    let err = backend
        .stream_chat(ChatRequest::new("hi", "c1"), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BackendError::Http {
            status: 503,
            detail: "model is loading".into()
        }
    );
    assert_eq!(err.to_string(), "HTTP 503: model is loading");
}

#[tokio::test]
async fn cancelled_token_aborts_before_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(sse("event: done\ndata: {}\n\n"))
        .expect(0)
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri(), None).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = backend
        .stream_chat(ChatRequest::new("hi", "c1"), cancel)
        .await
        .unwrap_err();
    assert_eq!(err, BackendError::Aborted);
}

#[tokio::test]
async fn cancelling_before_first_byte_yields_aborted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(sse("event: done\ndata: {}\n\n").set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri(), None).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = backend
        .stream_chat(ChatRequest::new("hi", "c1"), cancel)
        .await
        .unwrap_err();
    assert_eq!(err, BackendError::Aborted);
}

#[tokio::test]
async fn hard_timeout_is_not_an_abort() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(sse("event: done\ndata: {}\n\n").set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri(), None).unwrap().with_timeouts(Timeouts {
        stream: Duration::from_millis(100),
        ..Timeouts::default()
    });
    let err = backend
        .stream_chat(ChatRequest::new("hi", "c1"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Timeout(_)));
    assert!(!err.is_cancellation());
}

#[tokio::test]
async fn send_chat_normalizes_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "reply": "Hi there",
            "model": "qwen",
            "tool_events": [{"name": "search", "status": "ok"}]
        })))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri(), Some("secret".into())).unwrap();
    let reply = backend.send_chat(ChatRequest::new("hi", "c1")).await.unwrap();
    assert_eq!(reply.text, "Hi there");
    assert_eq!(reply.model.as_deref(), Some("qwen"));
    assert_eq!(reply.tool_events.len(), 1);
}

#[tokio::test]
async fn model_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "selected_model": "qwen",
            "models": [{"id": "qwen", "size": "1.5B", "supports_tools": true}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/select"))
        .and(body_partial_json(json!({"model_id": "qwen", "load": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/models/context-requirements"))
        .and(query_param("model_id", "qwen"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "context_window_requirements": {"reserve_tokens": 256, "model_context_limit": 32768},
            "params": {"context_window": 4096}
        })))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/models/qwen/params"))
        .and(body_partial_json(json!({"temperature": 0.2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/stop"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"stopped": true})))
        .expect(1)
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri(), None).unwrap();

    let catalog = backend.list_models().await.unwrap();
    assert_eq!(catalog.selected_id(), Some("qwen"));

    backend.select_model("qwen", true).await.unwrap();

    let req = backend.context_requirements("qwen").await.unwrap();
    assert_eq!(req.context_window_requirements.reserve_tokens, Some(256));
    assert_eq!(req.params.and_then(|p| p.context_window), Some(4096));

    let params = ModelParams {
        temperature: Some(0.2),
        ..ModelParams::default()
    };
    backend.update_model_params("qwen", &params).await.unwrap();

    backend.stop_generation().await.unwrap();
}

#[tokio::test]
async fn model_params_path_encodes_the_model_id() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/models/org%2Fmodel%20v2.5/params"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let backend = HttpBackend::new(server.uri(), None).unwrap();
    let params = ModelParams {
        max_tokens: Some(512),
        ..ModelParams::default()
    };
    backend
        .update_model_params(" org/model v2.5 ", &params)
        .await
        .unwrap();
}
