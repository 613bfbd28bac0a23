//! Scenario tuning: generation-parameter presets pushed to the backend.
//!
//! Each preset is applied at most once per (model, profile) signature.
//! Callers racing on the same signature share one in-flight `PATCH`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use tidewire_core::{Backend, BackendError, ModelParams};
use tracing::{debug, info, warn};

/// Drafts longer than this pick the long-context preset under `auto`.
const LONG_DRAFT_CHARS: usize = 6000;

const CODING_HINTS: &[&str] = &[
    "```", "fn ", "def ", "class ", "function", "compile", "stack trace", "traceback", "refactor",
    "regex", "sql", "bug", "code",
];

const RESEARCH_HINTS: &[&str] = &[
    "research", "analy", "compare", "sources", "summarize", "summarise", "explain why", "pros and cons",
];

/// Parameter preset family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioProfile {
    /// Pick one of the others from the draft.
    #[default]
    Auto,
    Chat,
    Coding,
    Research,
    LongContext,
}

impl ScenarioProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Chat => "chat",
            Self::Coding => "coding",
            Self::Research => "research",
            Self::LongContext => "long_context",
        }
    }

    /// Unknown names resolve to `Auto`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "chat" => Self::Chat,
            "coding" => Self::Coding,
            "research" => Self::Research,
            "long_context" => Self::LongContext,
            _ => Self::Auto,
        }
    }

    /// Resolve `Auto` against the draft; concrete profiles return themselves.
    pub fn resolve(self, draft: &str) -> Self {
        if self != Self::Auto {
            return self;
        }
        if draft.chars().count() > LONG_DRAFT_CHARS {
            return Self::LongContext;
        }
        let lower = draft.to_lowercase();
        if CODING_HINTS.iter().any(|h| lower.contains(h)) {
            Self::Coding
        } else if RESEARCH_HINTS.iter().any(|h| lower.contains(h)) {
            Self::Research
        } else {
            Self::Chat
        }
    }

    /// Parameters for this preset. `max_context` is the model's context
    /// limit, used by the long-context preset.
    pub fn params(self, max_context: Option<u32>) -> ModelParams {
        match self {
            Self::Auto | Self::Chat => ModelParams {
                temperature: Some(0.7),
                top_p: Some(0.9),
                ..ModelParams::default()
            },
            Self::Coding => ModelParams {
                temperature: Some(0.2),
                top_p: Some(0.9),
                max_tokens: Some(2048),
                ..ModelParams::default()
            },
            Self::Research => ModelParams {
                temperature: Some(0.4),
                max_tokens: Some(1536),
                ..ModelParams::default()
            },
            Self::LongContext => ModelParams {
                context_window: max_context,
                temperature: Some(0.5),
                ..ModelParams::default()
            },
        }
    }
}

impl std::fmt::Display for ScenarioProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type Application = Shared<BoxFuture<'static, Result<(), BackendError>>>;

/// Applies scenario presets, deduplicated by signature.
pub struct ScenarioTuner {
    backend: Arc<dyn Backend>,
    applied: Mutex<HashSet<String>>,
    in_flight: Mutex<HashMap<String, Application>>,
}

fn signature(model_id: &str, profile: ScenarioProfile) -> String {
    format!("{model_id}::{profile}")
}

impl ScenarioTuner {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            applied: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_applied(&self, model_id: &str, profile: ScenarioProfile) -> bool {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&signature(model_id, profile))
    }

    /// Push `profile`'s preset for `model_id`.
    ///
    /// Returns `Ok(false)` when nothing had to be sent. A failed
    /// application is not remembered, so the next call retries it.
    pub async fn apply(
        &self,
        model_id: &str,
        profile: ScenarioProfile,
        max_context: Option<u32>,
    ) -> Result<bool, BackendError> {
        let model_id = model_id.trim();
        if model_id.is_empty() || profile == ScenarioProfile::Auto {
            return Ok(false);
        }
        let key = signature(model_id, profile);
        if self.is_applied(model_id, profile) {
            debug!(signature = %key, "Scenario already applied");
            return Ok(false);
        }

        let application = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_insert_with(|| {
                let backend = self.backend.clone();
                let model = model_id.to_string();
                let params = profile.params(max_context);
                async move { backend.update_model_params(&model, &params).await }
                    .boxed()
                    .shared()
            })
            .clone();

        let result = application.await;
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);

        match result {
            Ok(()) => {
                self.applied
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key);
                info!(model = %model_id, profile = %profile, "Scenario parameters applied");
                Ok(true)
            }
            Err(e) => {
                warn!(model = %model_id, profile = %profile, error = %e, "Scenario parameters not applied");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tidewire_core::{ChatReply, ChatRequest, ContextRequirements};

    struct ParamsBackend {
        fail: bool,
        calls: Mutex<Vec<(String, ModelParams)>>,
    }

    impl ParamsBackend {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Backend for ParamsBackend {
        fn name(&self) -> &str {
            "params"
        }

        async fn send_chat(&self, _request: ChatRequest) -> Result<ChatReply, BackendError> {
            unreachable!("tuning never sends chats")
        }

        async fn context_requirements(
            &self,
            _model_id: &str,
        ) -> Result<ContextRequirements, BackendError> {
            Ok(ContextRequirements::default())
        }

        async fn update_model_params(
            &self,
            model_id: &str,
            params: &ModelParams,
        ) -> Result<(), BackendError> {
            self.calls
                .lock()
                .unwrap()
                .push((model_id.to_string(), params.clone()));
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(BackendError::Http {
                    status: 500,
                    detail: "params rejected".into(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn auto_resolves_from_the_draft() {
        assert_eq!(
            ScenarioProfile::Auto.resolve("why does this regex fail?"),
            ScenarioProfile::Coding
        );
        assert_eq!(
            ScenarioProfile::Auto.resolve("compare these two papers"),
            ScenarioProfile::Research
        );
        assert_eq!(ScenarioProfile::Auto.resolve("hi there"), ScenarioProfile::Chat);
        assert_eq!(
            ScenarioProfile::Auto.resolve(&"x".repeat(7000)),
            ScenarioProfile::LongContext
        );
        assert_eq!(ScenarioProfile::Chat.resolve("```rust```"), ScenarioProfile::Chat);
    }

    #[test]
    fn presets() {
        let coding = ScenarioProfile::Coding.params(None);
        assert_eq!(coding.temperature, Some(0.2));
        assert_eq!(coding.max_tokens, Some(2048));

        let long = ScenarioProfile::LongContext.params(Some(32_768));
        assert_eq!(long.context_window, Some(32_768));
        assert_eq!(ScenarioProfile::parse("long-context"), ScenarioProfile::LongContext);
        assert_eq!(ScenarioProfile::parse("???"), ScenarioProfile::Auto);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_application() {
        let backend = Arc::new(ParamsBackend::new(false));
        let tuner = ScenarioTuner::new(backend.clone());

        let (a, b) = tokio::join!(
            tuner.apply("qwen", ScenarioProfile::Coding, None),
            tuner.apply("qwen", ScenarioProfile::Coding, None)
        );
        assert!(a.unwrap());
        assert!(b.unwrap());
        assert_eq!(backend.call_count(), 1);

        assert!(!tuner.apply("qwen", ScenarioProfile::Coding, None).await.unwrap());
        assert_eq!(backend.call_count(), 1);

        tuner.apply("qwen", ScenarioProfile::Chat, None).await.unwrap();
        tuner.apply("llama", ScenarioProfile::Coding, None).await.unwrap();
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn failures_are_retried_later() {
        let backend = Arc::new(ParamsBackend::new(true));
        let tuner = ScenarioTuner::new(backend.clone());

        assert!(tuner.apply("qwen", ScenarioProfile::Chat, None).await.is_err());
        assert!(!tuner.is_applied("qwen", ScenarioProfile::Chat));
        assert!(tuner.apply("qwen", ScenarioProfile::Chat, None).await.is_err());
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn auto_and_empty_model_are_skipped() {
        let backend = Arc::new(ParamsBackend::new(false));
        let tuner = ScenarioTuner::new(backend.clone());
        assert!(!tuner.apply("qwen", ScenarioProfile::Auto, None).await.unwrap());
        assert!(!tuner.apply("  ", ScenarioProfile::Chat, None).await.unwrap());
        assert_eq!(backend.call_count(), 0);
    }
}
