//! Model catalog, context budgets, and fallback plans.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Window assumed before the backend has reported anything.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 8192;

/// Bounds every effective context window is clamped into.
pub const MIN_CONTEXT_WINDOW: u32 = 512;
pub const MAX_CONTEXT_WINDOW: u32 = 262_144;

/// Lower bound for a per-model configured window.
const MIN_CONFIGURED_WINDOW: u32 = 256;

// ── Catalog ─────────────────────────────────────────────────────────────

/// The `/models` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCatalog {
    #[serde(default)]
    pub selected_model: Option<String>,

    #[serde(default)]
    pub loaded_model: Option<String>,

    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

impl ModelCatalog {
    pub fn get(&self, model_id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.id == model_id)
    }

    /// The selected model id, falling back to the entry flagged `selected`.
    pub fn selected_id(&self) -> Option<&str> {
        self.selected_model
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.models.iter().find(|m| m.selected).map(|m| m.id.as_str()))
    }

    /// Whether `model_id` is the model currently resident in memory.
    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.loaded_model.as_deref() == Some(model_id)
            || self.get(model_id).is_some_and(|m| m.loaded)
    }
}

/// One entry of the model catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,

    #[serde(default)]
    pub label: String,

    /// Parameter count as advertised, e.g. `"1.5B"`.
    #[serde(default)]
    pub size: String,

    #[serde(default)]
    pub supports_tools: bool,

    #[serde(default)]
    pub estimated_unified_memory_bytes: u64,

    #[serde(default)]
    pub max_context: Option<u32>,

    #[serde(default)]
    pub cache: CacheState,

    #[serde(default)]
    pub compatibility: Compatibility,

    #[serde(default)]
    pub selected: bool,

    #[serde(default)]
    pub loaded: bool,

    #[serde(default)]
    pub params: Option<ModelParams>,
}

impl ModelInfo {
    /// Parameter count in billions parsed from `size` (`"0.5B"`, `"7b"`,
    /// `"350M"`). Unparseable sizes yield `None`.
    pub fn size_billions(&self) -> Option<f64> {
        let raw = self.size.trim().to_ascii_lowercase();
        let (number, divisor) = if let Some(n) = raw.strip_suffix('b') {
            (n, 1.0)
        } else if let Some(n) = raw.strip_suffix('m') {
            (n, 1000.0)
        } else {
            (raw.as_str(), 1.0)
        };
        number.trim().parse::<f64>().ok().map(|v| v / divisor)
    }

    /// Sort key used to order models by size. Falls back to the memory
    /// estimate when the size label is missing.
    pub fn size_key(&self) -> f64 {
        self.size_billions()
            .unwrap_or(self.estimated_unified_memory_bytes as f64 / 1e9)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheState {
    #[serde(default)]
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compatibility {
    #[serde(default = "default_true")]
    pub compatible: bool,

    #[serde(default)]
    pub level: String,

    #[serde(default)]
    pub reason: String,
}

fn default_true() -> bool {
    true
}

impl Default for Compatibility {
    fn default() -> Self {
        Self {
            compatible: true,
            level: "ok".into(),
            reason: String::new(),
        }
    }
}

/// Generation parameters stored per model (`PATCH /models/{id}/params`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

// ── Context budget ──────────────────────────────────────────────────────

/// The `/models/context-requirements` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextRequirements {
    #[serde(default)]
    pub context_window_requirements: RequirementFields,

    #[serde(default)]
    pub params: Option<ModelParams>,

    #[serde(default)]
    pub usage: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequirementFields {
    #[serde(default)]
    pub system_prompt_tokens: Option<u32>,

    #[serde(default)]
    pub history_overhead_tokens: Option<u32>,

    #[serde(default)]
    pub reserve_tokens: Option<u32>,

    #[serde(default)]
    pub min_context_window: Option<u32>,

    #[serde(default)]
    pub model_context_limit: Option<u32>,
}

/// Token budget of the active model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub context_window: u32,
    pub system_prompt_tokens: u32,
    pub history_overhead_tokens: u32,
    pub reserve_tokens: u32,
    pub min_context_window: u32,
    pub model_context_limit: u32,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            context_window: DEFAULT_CONTEXT_WINDOW,
            system_prompt_tokens: 0,
            history_overhead_tokens: 48,
            reserve_tokens: 192,
            min_context_window: 1024,
            model_context_limit: MAX_CONTEXT_WINDOW,
        }
    }
}

impl ContextBudget {
    /// Derive the next budget from a requirements payload.
    ///
    /// Fields missing (or zero) in the payload keep their current values.
    /// The window prefers the backend's live usage window, then the model's
    /// configured window, then `max(min_context_window, 8192)`.
    pub fn apply(&self, payload: &ContextRequirements) -> Self {
        let req = &payload.context_window_requirements;
        let limit = req
            .model_context_limit
            .filter(|v| *v > 0)
            .map(|v| v.clamp(MIN_CONTEXT_WINDOW, MAX_CONTEXT_WINDOW))
            .unwrap_or(MAX_CONTEXT_WINDOW);

        let configured = payload
            .params
            .as_ref()
            .and_then(|p| p.context_window)
            .filter(|v| *v > 0)
            .map(|v| v.clamp(MIN_CONFIGURED_WINDOW, limit));

        let live = payload
            .usage
            .as_ref()
            .and_then(|u| u.get("context_window").or_else(|| u.get("contextWindow")))
            .and_then(Value::as_u64)
            .filter(|v| *v > 0)
            .map(|v| (v.min(u32::MAX as u64) as u32).clamp(MIN_CONFIGURED_WINDOW, limit));

        let min_required = req
            .min_context_window
            .unwrap_or(0)
            .clamp(MIN_CONTEXT_WINDOW, limit);

        let window = live
            .or(configured)
            .unwrap_or_else(|| min_required.max(DEFAULT_CONTEXT_WINDOW));

        let pick = |incoming: Option<u32>, current: u32| {
            incoming
                .filter(|v| *v > 0)
                .map(|v| v.min(MAX_CONTEXT_WINDOW))
                .unwrap_or(current)
        };

        Self {
            context_window: window.clamp(MIN_CONTEXT_WINDOW, MAX_CONTEXT_WINDOW),
            system_prompt_tokens: pick(req.system_prompt_tokens, self.system_prompt_tokens),
            history_overhead_tokens: pick(req.history_overhead_tokens, self.history_overhead_tokens),
            reserve_tokens: pick(req.reserve_tokens, self.reserve_tokens),
            min_context_window: pick(req.min_context_window, self.min_context_window),
            model_context_limit: limit,
        }
    }

    /// Fixed cost of any request: `max(64, system + overhead + reserve)`.
    pub fn baseline_tokens(&self) -> u32 {
        self.system_prompt_tokens
            .saturating_add(self.history_overhead_tokens)
            .saturating_add(self.reserve_tokens)
            .max(64)
    }
}

// ── Fallback ────────────────────────────────────────────────────────────

/// How far the orchestrator may stray from the current model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackProfile {
    /// Only models that are already cached or loaded.
    Conservative,
    #[default]
    Balanced,
    Aggressive,
}

impl FallbackProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
        }
    }

    /// Unknown names resolve to `Balanced`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "conservative" => Self::Conservative,
            "aggressive" => Self::Aggressive,
            _ => Self::Balanced,
        }
    }
}

impl std::fmt::Display for FallbackProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A catalog entry considered as a fallback target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCandidate {
    pub id: String,
    pub label: String,
    pub supports_tools: bool,
    pub compatible: bool,
    pub cached: bool,
    pub loaded: bool,
    /// Position in the catalog ordered by size, smallest first.
    pub size_rank: usize,
    /// Lower is tried first.
    pub score: f64,
}

/// Ordered fallback candidates for one failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackPlan {
    pub profile: FallbackProfile,
    pub selected_model_id: String,
    pub candidates: Vec<ModelCandidate>,
}

impl FallbackPlan {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
