pub mod chat;
pub mod config_cmd;
pub mod context;
pub mod init;
pub mod models;
pub mod stop;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tidewire_backend::HttpBackend;
use tidewire_config::AppConfig;
use tidewire_core::{HistoryEntry, InMemoryChatStore};
use tidewire_runtime::AssistantRuntime;

pub fn load_config() -> anyhow::Result<AppConfig> {
    AppConfig::load().context("Failed to load config")
}

pub fn connect(config: &AppConfig) -> anyhow::Result<Arc<HttpBackend>> {
    let backend = HttpBackend::from_config(&config.backend)
        .with_context(|| format!("Cannot reach backend at {}", config.backend.base_url))?;
    Ok(Arc::new(backend))
}

/// Read a JSON array of history entries.
pub fn read_history(path: &Path) -> anyhow::Result<Vec<HistoryEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read history file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of history entries", path.display()))
}

/// A runtime over a fresh in-memory store, optionally seeded for `chat_id`.
pub async fn build_runtime(
    config: &AppConfig,
    chat_id: &str,
    history: Option<&Path>,
) -> anyhow::Result<AssistantRuntime> {
    let backend = connect(config)?;
    let store = Arc::new(InMemoryChatStore::new());
    if let Some(path) = history {
        let entries = read_history(path)?;
        tracing::debug!(chat_id = %chat_id, entries = entries.len(), "Seeding chat history");
        store.seed(chat_id, entries).await;
    }
    let runtime = AssistantRuntime::from_config(config, backend, store);
    match runtime.sync_model().await {
        Ok(model) => tracing::debug!(model = %model, "Active model"),
        Err(e) => tracing::warn!(error = %e, "Could not read the backend's model selection"),
    }
    Ok(runtime)
}
