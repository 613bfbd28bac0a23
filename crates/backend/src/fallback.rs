//! Model fallback: retry a failed generation on other catalog models.
//!
//! When the current model cannot serve a request (out of memory, timeout,
//! still loading), the orchestrator builds an ordered candidate list from
//! the catalog, selects each candidate in turn and retries. If every
//! candidate fails, the original selection is restored and the last error
//! is returned.

use std::future::Future;
use std::sync::Arc;

use tidewire_core::{
    Backend, BackendError, FallbackPlan, FallbackProfile, ModelCandidate, ModelCatalog,
};
use tracing::{info, warn};

use crate::classify::{ErrorClassifier, PatternClassifier};

const LOADED_BONUS: f64 = 3.0;
const CACHED_BONUS: f64 = 1.5;
const LARGER_BASE_PENALTY: f64 = 2.0;
const LARGER_GAP_PENALTY: f64 = 1.5;
const SMALLER_BONUS: f64 = 0.5;

/// Result of a successful fallback.
#[derive(Debug, Clone)]
pub struct FallbackOutcome<T> {
    pub value: T,
    /// Model that produced `value`.
    pub served_by: String,
    /// Candidates tried, including the successful one.
    pub attempts: usize,
}

/// Build the ordered candidate list for a failure on `current`.
///
/// Excludes `current`, tool-less and incompatible models. Conservative
/// plans keep only cached or loaded models; other profiles keep every
/// usable model and let the size-gap penalty push larger ones back. Candidates are sorted by ascending score:
/// size rank, minus a bonus for loaded/cached weights, plus a penalty
/// growing with how much larger than `current` they are.
pub fn plan(catalog: &ModelCatalog, current: &str, profile: FallbackProfile) -> FallbackPlan {
    let mut by_size: Vec<_> = catalog.models.iter().collect();
    by_size.sort_by(|a, b| {
        a.size_key()
            .total_cmp(&b.size_key())
            .then_with(|| a.id.cmp(&b.id))
    });
    let rank_of = |id: &str| by_size.iter().position(|m| m.id == id);
    let current_rank = rank_of(current);

    let mut candidates: Vec<ModelCandidate> = by_size
        .iter()
        .enumerate()
        .filter(|(_, m)| m.id != current && m.supports_tools && m.compatibility.compatible)
        .filter_map(|(rank, m)| {
            let loaded = catalog.is_loaded(&m.id);
            let cached = m.cache.cached;
            if profile == FallbackProfile::Conservative && !(cached || loaded) {
                return None;
            }

            let mut score = rank as f64;
            if loaded {
                score -= LOADED_BONUS;
            } else if cached {
                score -= CACHED_BONUS;
            }
            if let Some(current_rank) = current_rank {
                if rank > current_rank {
                    let gap = rank - current_rank;
                    score += LARGER_BASE_PENALTY + gap as f64 * LARGER_GAP_PENALTY;
                } else {
                    score -= SMALLER_BONUS;
                }
            }

            Some(ModelCandidate {
                id: m.id.clone(),
                label: if m.label.is_empty() {
                    m.id.clone()
                } else {
                    m.label.clone()
                },
                supports_tools: m.supports_tools,
                compatible: m.compatibility.compatible,
                cached,
                loaded,
                size_rank: rank,
                score,
            })
        })
        .collect();

    candidates.sort_by(|a, b| a.score.total_cmp(&b.score).then_with(|| a.id.cmp(&b.id)));

    FallbackPlan {
        profile,
        selected_model_id: current.to_string(),
        candidates,
    }
}

/// Retries generations on alternative models.
pub struct ModelFallback {
    backend: Arc<dyn Backend>,
    classifier: Arc<dyn ErrorClassifier>,
    profile: FallbackProfile,
    enabled: bool,
}

impl ModelFallback {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            classifier: Arc::new(PatternClassifier::new()),
            profile: FallbackProfile::default(),
            enabled: true,
        }
    }

    pub fn with_profile(mut self, profile: FallbackProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn profile(&self) -> FallbackProfile {
        self.profile
    }

    /// Whether `error` should trigger a fallback at all.
    pub fn should_fallback(&self, error: &BackendError) -> bool {
        self.enabled && self.classifier.classify(error).is_resource()
    }

    /// Fetch the catalog and build the plan for `current`.
    pub async fn plan_for(&self, current: &str) -> Result<FallbackPlan, BackendError> {
        let catalog = self.backend.list_models().await?;
        Ok(plan(&catalog, current, self.profile))
    }

    /// Recover from `error` by retrying `attempt` on each fallback candidate.
    ///
    /// `attempt` receives the candidate model id after it has been selected
    /// on the backend. Errors that are not resource-class are returned
    /// unchanged without touching the selection.
    pub async fn run<T, F, Fut>(
        &self,
        current: &str,
        error: BackendError,
        mut attempt: F,
    ) -> Result<FallbackOutcome<T>, BackendError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        if !self.should_fallback(&error) {
            return Err(error);
        }

        let plan = match self.plan_for(current).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "Fallback: could not fetch model catalog");
                return Err(error);
            }
        };
        if plan.is_empty() {
            info!(model = %current, profile = %self.profile, "Fallback: no candidates");
            return Err(error);
        }

        let total = plan.candidates.len();
        let mut last_error = error;

        for (i, candidate) in plan.candidates.iter().enumerate() {
            info!(
                from = %current,
                model = %candidate.id,
                attempt = i + 1,
                total,
                "Fallback: trying model"
            );

            if let Err(e) = self.backend.select_model(&candidate.id, true).await {
                warn!(model = %candidate.id, error = %e, "Fallback: select failed, trying next");
                last_error = e;
                continue;
            }

            match attempt(candidate.id.clone()).await {
                Ok(value) => {
                    info!(model = %candidate.id, "Fallback: model served the request");
                    return Ok(FallbackOutcome {
                        value,
                        served_by: candidate.id.clone(),
                        attempts: i + 1,
                    });
                }
                Err(e) if e.is_cancellation() => {
                    self.restore(current).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(model = %candidate.id, error = %e, "Fallback: model failed, trying next");
                    last_error = e;
                }
            }
        }

        self.restore(current).await;
        Err(last_error)
    }

    async fn restore(&self, original: &str) {
        if original.is_empty() {
            return;
        }
        if let Err(e) = self.backend.select_model(original, false).await {
            warn!(model = %original, error = %e, "Fallback: could not restore original model");
        }
    }
}
