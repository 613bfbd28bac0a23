//! Configuration loading, validation, and management for Tidewire.
//!
//! Loads configuration from `~/.tidewire/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tidewire_core::FallbackProfile;

/// The root configuration structure.
///
/// Maps directly to `~/.tidewire/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Inference backend connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Model selection and scenario tuning
    #[serde(default)]
    pub model: ModelConfig,

    /// Context window guard
    #[serde(default)]
    pub context_guard: ContextGuardConfig,

    /// Automatic model fallback
    #[serde(default)]
    pub fallback: FallbackConfig,
}

/// Connection settings for the inference backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Hard timeout for plain requests
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Hard timeout for a whole generation stream
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,

    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    #[serde(default = "default_params_timeout_ms")]
    pub params_timeout_ms: u64,

    #[serde(default = "default_requirements_timeout_ms")]
    pub requirements_timeout_ms: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:5055".into()
}
fn default_request_timeout_ms() -> u64 {
    12_000
}
fn default_stream_timeout_ms() -> u64 {
    300_000
}
fn default_stop_timeout_ms() -> u64 {
    8_000
}
fn default_params_timeout_ms() -> u64 {
    30_000
}
fn default_requirements_timeout_ms() -> u64 {
    20_000
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn params_timeout(&self) -> Duration {
        Duration::from_millis(self.params_timeout_ms)
    }

    pub fn requirements_timeout(&self) -> Duration {
        Duration::from_millis(self.requirements_timeout_ms)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            request_timeout_ms: default_request_timeout_ms(),
            stream_timeout_ms: default_stream_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            params_timeout_ms: default_params_timeout_ms(),
            requirements_timeout_ms: default_requirements_timeout_ms(),
        }
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("stream_timeout_ms", &self.stream_timeout_ms)
            .field("stop_timeout_ms", &self.stop_timeout_ms)
            .field("params_timeout_ms", &self.params_timeout_ms)
            .field("requirements_timeout_ms", &self.requirements_timeout_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model to select when the backend reports none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Scenario preset: auto, chat, coding, research, long_context
    #[serde(default = "default_scenario_profile")]
    pub scenario_profile: String,

    /// Push the scenario preset to the backend before each turn
    #[serde(default = "default_true")]
    pub auto_apply_scenario: bool,
}

fn default_scenario_profile() -> String {
    "auto".into()
}
fn default_true() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            scenario_profile: default_scenario_profile(),
            auto_apply_scenario: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextGuardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Compress history automatically when a request would overflow
    #[serde(default = "default_true")]
    pub auto_compress: bool,

    /// Age after which cached requirements are refetched
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Quiet period that coalesces refresh triggers
    #[serde(default = "default_refresh_debounce_ms")]
    pub refresh_debounce_ms: u64,
}

fn default_stale_after_secs() -> u64 {
    90
}
fn default_refresh_debounce_ms() -> u64 {
    320
}

impl ContextGuardConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }
}

impl Default for ContextGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_compress: true,
            stale_after_secs: default_stale_after_secs(),
            refresh_debounce_ms: default_refresh_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// conservative, balanced or aggressive
    #[serde(default = "default_fallback_profile")]
    pub profile: String,
}

fn default_fallback_profile() -> String {
    "balanced".into()
}

impl FallbackConfig {
    pub fn profile(&self) -> FallbackProfile {
        FallbackProfile::parse(&self.profile)
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            profile: default_fallback_profile(),
        }
    }
}

const SCENARIO_PROFILES: &[&str] = &["auto", "chat", "coding", "research", "long_context"];
const FALLBACK_PROFILES: &[&str] = &["conservative", "balanced", "aggressive"];

impl AppConfig {
    /// Load configuration from the default path (~/.tidewire/config.toml).
    ///
    /// Environment overrides:
    /// - `TIDEWIRE_BACKEND_URL`
    /// - `TIDEWIRE_API_KEY` (only when the file sets none)
    /// - `TIDEWIRE_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(url) = std::env::var("TIDEWIRE_BACKEND_URL") {
            config.backend.base_url = url;
        }

        if config.backend.api_key.is_none() {
            config.backend.api_key = std::env::var("TIDEWIRE_API_KEY").ok();
        }

        if let Ok(model) = std::env::var("TIDEWIRE_MODEL") {
            config.model.default_model = Some(model);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tidewire")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.backend.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "backend.base_url must be an http(s) URL, got '{url}'"
            )));
        }

        let timeouts = [
            ("request_timeout_ms", self.backend.request_timeout_ms),
            ("stream_timeout_ms", self.backend.stream_timeout_ms),
            ("stop_timeout_ms", self.backend.stop_timeout_ms),
            ("params_timeout_ms", self.backend.params_timeout_ms),
            ("requirements_timeout_ms", self.backend.requirements_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ValidationError(format!(
                "backend.{name} must be > 0"
            )));
        }

        let profile = self.fallback.profile.trim().to_ascii_lowercase();
        if !FALLBACK_PROFILES.contains(&profile.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "fallback.profile must be one of {FALLBACK_PROFILES:?}, got '{}'",
                self.fallback.profile
            )));
        }

        let scenario = self.model.scenario_profile.trim().to_ascii_lowercase();
        if !SCENARIO_PROFILES.contains(&scenario.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "model.scenario_profile must be one of {SCENARIO_PROFILES:?}, got '{}'",
                self.model.scenario_profile
            )));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.backend.api_key.is_some()
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
