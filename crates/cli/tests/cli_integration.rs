//! End-to-end tests for the `tidewire` binary.
//!
//! Each test runs the compiled binary with `HOME` pointed at a temp dir and
//! the backend URL pointed at a mock inference server.

use std::path::Path;
use std::process::Output;

use serde_json::json;
use tokio::process::Command;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ── Helpers ─────────────────────────────────────────────────────────────

async fn tidewire(home: &Path, backend: Option<&str>, args: &[&str]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tidewire"));
    cmd.args(args)
        .env("HOME", home)
        .env("RUST_LOG", "warn")
        .env_remove("TIDEWIRE_API_KEY")
        .env_remove("TIDEWIRE_MODEL");
    match backend {
        Some(url) => cmd.env("TIDEWIRE_BACKEND_URL", url),
        None => cmd.env_remove("TIDEWIRE_BACKEND_URL"),
    };
    cmd.output().await.expect("failed to run tidewire")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn sse(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/event-stream")
}

async fn mock_catalog(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "selected_model": "mid",
            "loaded_model": "mid",
            "models": [
                {"id": "small", "size": "1.5B", "supports_tools": true, "cache": {"cached": true}},
                {"id": "mid", "size": "3B", "supports_tools": true},
                {"id": "large", "size": "7B", "supports_tools": true}
            ]
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/models/context-requirements"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "context_window_requirements": {
                "system_prompt_tokens": 200,
                "model_context_limit": 32768
            },
            "params": {"context_window": 4096}
        })))
        .mount(server)
        .await;

    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(server)
        .await;
}

// ── Config ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn config_path_points_into_home() {
    let home = tempfile::tempdir().unwrap();
    let output = tidewire(home.path(), None, &["config", "path"]).await;

    assert!(output.status.success());
    let expected = home.path().join(".tidewire").join("config.toml");
    assert_eq!(stdout(&output).trim(), expected.display().to_string());
}

#[tokio::test]
async fn init_writes_a_loadable_config_once() {
    let home = tempfile::tempdir().unwrap();
    let config_path = home.path().join(".tidewire").join("config.toml");

    let first = tidewire(home.path(), None, &["init"]).await;
    assert!(first.status.success());
    assert!(config_path.exists());
    let written = std::fs::read_to_string(&config_path).unwrap();
    assert!(tidewire_config::AppConfig::load_from(&config_path).is_ok());

    let second = tidewire(home.path(), None, &["init"]).await;
    assert!(second.status.success());
    assert!(stdout(&second).contains("already exists"));
    assert_eq!(std::fs::read_to_string(&config_path).unwrap(), written);
}

#[tokio::test]
async fn invalid_config_fails_validation() {
    let home = tempfile::tempdir().unwrap();
    let dir = home.path().join(".tidewire");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.toml"), "[fallback]\nprofile = \"reckless\"\n").unwrap();

    let output = tidewire(home.path(), None, &["config", "validate"]).await;
    assert!(!output.status.success());
    assert!(stdout(&output).contains("Config error"));
}

#[tokio::test]
async fn config_show_masks_the_api_key() {
    let home = tempfile::tempdir().unwrap();
    let dir = home.path().join(".tidewire");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("config.toml"),
        "[backend]\nbase_url = \"http://127.0.0.1:5055\"\napi_key = \"hunter2\"\n",
    )
    .unwrap();

    let output = tidewire(home.path(), None, &["config", "show"]).await;
    assert!(output.status.success());
    let shown = stdout(&output);
    assert!(!shown.contains("hunter2"));
    assert!(shown.contains("***"));
}

// ── Backend commands ────────────────────────────────────────────────────

#[tokio::test]
async fn chat_prints_the_streamed_reply() {
    let server = MockServer::start().await;
    mock_catalog(&server).await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .and(body_partial_json(json!({"message": "hello", "context": {"chat_id": "default"}})))
        .respond_with(sse(
            "event: start\ndata: {\"model\":\"mid\"}\n\n\
             event: delta\ndata: {\"text\":\"Hi \"}\n\n\
             event: delta\ndata: {\"text\":\"Hi there\"}\n\n\
             event: done\ndata: {\"reply\":\"Hi there\",\"model\":\"mid\"}\n\n",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let home = tempfile::tempdir().unwrap();
    let output = tidewire(home.path(), Some(&server.uri()), &["chat", "-m", "hello"]).await;

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout(&output).trim(), "Hi there");
}

#[tokio::test]
async fn chat_falls_back_when_the_model_runs_out_of_memory() {
    let server = MockServer::start().await;
    mock_catalog(&server).await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(sse(
            "event: error\ndata: {\"message\":\"CUDA out of memory\"}\n\n",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/select"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "reply": "smaller answer",
            "model": "small"
        })))
        .mount(&server)
        .await;

    let home = tempfile::tempdir().unwrap();
    let output = tidewire(home.path(), Some(&server.uri()), &["chat", "-m", "hello"]).await;

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("smaller answer"));
    assert!(String::from_utf8_lossy(&output.stderr).contains("served by small"));
}

#[tokio::test]
async fn models_lists_the_catalog_and_plan() {
    let server = MockServer::start().await;
    mock_catalog(&server).await;

    let home = tempfile::tempdir().unwrap();
    let output = tidewire(home.path(), Some(&server.uri()), &["models", "--plan"]).await;

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let shown = stdout(&output);
    assert!(shown.contains("small"));
    assert!(shown.contains("large"));
    assert!(shown.contains("Fallback plan for mid (balanced)"));
}

#[tokio::test]
async fn context_reports_the_refreshed_window() {
    let server = MockServer::start().await;
    mock_catalog(&server).await;

    let home = tempfile::tempdir().unwrap();
    let output = tidewire(
        home.path(),
        Some(&server.uri()),
        &["context", "--draft", "how long is this?"],
    )
    .await;

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let shown = stdout(&output);
    assert!(shown.contains("Context window: 4096"));
    assert!(shown.contains("Model:          mid"));
}

#[tokio::test]
async fn stop_posts_to_the_backend() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/stop"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"stopped": true})))
        .expect(1)
        .mount(&server)
        .await;

    let home = tempfile::tempdir().unwrap();
    let output = tidewire(home.path(), Some(&server.uri()), &["stop"]).await;

    assert!(output.status.success());
    assert!(stdout(&output).contains("Stop requested"));
}

#[cfg(unix)]
#[tokio::test]
async fn interrupt_at_the_idle_prompt_exits_chat() {
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    let server = MockServer::start().await;
    mock_catalog(&server).await;
    let home = tempfile::tempdir().unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_tidewire"))
        .arg("chat")
        .env("HOME", home.path())
        .env("RUST_LOG", "warn")
        .env("TIDEWIRE_BACKEND_URL", server.uri())
        .env_remove("TIDEWIRE_API_KEY")
        .env_remove("TIDEWIRE_MODEL")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("failed to spawn tidewire");
    let _stdin = child.stdin.take();
    let mut out = child.stdout.take().unwrap();

    let mut seen = Vec::new();
    let mut buf = [0u8; 512];
    while !String::from_utf8_lossy(&seen).contains("You >") {
        let n = tokio::time::timeout(Duration::from_secs(10), out.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "chat exited before prompting");
        seen.extend_from_slice(&buf[..n]);
    }
    // Let the prompt loop install its signal handler.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let pid = child.id().unwrap().to_string();
    let killed = Command::new("kill").args(["-INT", &pid]).status().await.unwrap();
    assert!(killed.success());

    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .unwrap()
        .unwrap();
    out.read_to_end(&mut seen).await.unwrap();
    assert!(status.success());
    assert!(String::from_utf8_lossy(&seen).contains("Goodbye"));
}
