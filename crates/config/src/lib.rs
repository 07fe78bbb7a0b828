//! Configuration loading, validation, and management for tandem.
//!
//! Loads configuration from `~/.tandem/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tandem_core::step::{Step, StepConfig};

/// The root configuration structure.
///
/// Maps directly to `~/.tandem/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub llm: LlmSettings,

    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &str) -> &'static str {
    if s.is_empty() { "None" } else { "[REDACTED]" }
}

// ── Storage ───────────────────────────────────────────────────────────────

/// Which storage provider backs session state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process memory. No persistence, single instance only.
    #[default]
    Memory,
    /// Redis-compatible REST key/value service.
    Kv,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Kv => write!(f, "kv"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in_memory" => Ok(Self::Memory),
            "kv" | "redis" | "upstash" => Ok(Self::Kv),
            other => Err(ConfigError::ValidationError(format!(
                "unknown storage backend '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// REST endpoint of the key/value service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Session lifetime, measured from the last write
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_ttl_secs() -> u64 {
    30 * 60
}
fn default_key_prefix() -> String {
    "orchestration:session:".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            url: None,
            token: None,
            ttl_secs: default_ttl_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("url", &self.url)
            .field("token", &redact(self.token.as_deref().unwrap_or("")))
            .field("ttl_secs", &self.ttl_secs)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

// ── LLM ───────────────────────────────────────────────────────────────────

/// One provider configuration. Each variant carries exactly the fields
/// that provider understands.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum LlmConfig {
    Anthropic {
        #[serde(default)]
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_url: Option<String>,
    },
    #[serde(rename = "openai")]
    OpenAi {
        #[serde(default)]
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_url: Option<String>,
    },
    #[serde(rename = "openrouter")]
    OpenRouter {
        #[serde(default)]
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Gemini {
        #[serde(default)]
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Ollama {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_url: Option<String>,
    },
}

/// What makes two LLM configurations interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LlmFingerprint {
    pub provider: &'static str,
    pub credential: String,
    pub model: String,
}

impl LlmConfig {
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Anthropic { .. } => "anthropic",
            Self::OpenAi { .. } => "openai",
            Self::OpenRouter { .. } => "openrouter",
            Self::Gemini { .. } => "gemini",
            Self::Ollama { .. } => "ollama",
        }
    }

    /// The model id actually used: the configured one, or the provider default.
    pub fn resolved_model(&self) -> String {
        let (configured, fallback) = match self {
            Self::Anthropic { model, .. } => (model, "claude-sonnet-4-20250514"),
            Self::OpenAi { model, .. } => (model, "gpt-4o"),
            Self::OpenRouter { model, .. } => (model, "anthropic/claude-sonnet-4"),
            Self::Gemini { model, .. } => (model, "gemini-2.0-flash"),
            Self::Ollama { model, .. } => (model, "llama3.1"),
        };
        configured
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(fallback)
            .to_string()
    }

    /// The API key, or `None` for providers that need none.
    pub fn credential(&self) -> Option<&str> {
        match self {
            Self::Anthropic { api_key, .. }
            | Self::OpenAi { api_key, .. }
            | Self::OpenRouter { api_key, .. }
            | Self::Gemini { api_key, .. } => Some(api_key.as_str()),
            Self::Ollama { .. } => None,
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        match self {
            Self::Anthropic { base_url, .. }
            | Self::OpenAi { base_url, .. }
            | Self::Ollama { base_url, .. } => base_url.as_deref(),
            Self::OpenRouter { .. } | Self::Gemini { .. } => None,
        }
    }

    pub fn fingerprint(&self) -> LlmFingerprint {
        LlmFingerprint {
            provider: self.provider_name(),
            credential: self.credential().unwrap_or_default().to_string(),
            model: self.resolved_model(),
        }
    }

    /// Environment variable conventionally holding this provider's key.
    pub fn credential_env_var(&self) -> Option<&'static str> {
        match self {
            Self::Anthropic { .. } => Some("ANTHROPIC_API_KEY"),
            Self::OpenAi { .. } => Some("OPENAI_API_KEY"),
            Self::OpenRouter { .. } => Some("OPENROUTER_API_KEY"),
            Self::Gemini { .. } => Some("GEMINI_API_KEY"),
            Self::Ollama { .. } => None,
        }
    }

    /// Fill an empty API key from `lookup(credential_env_var)`.
    fn fill_credential(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        let Some(var) = self.credential_env_var() else {
            return;
        };
        let key = match self {
            Self::Anthropic { api_key, .. }
            | Self::OpenAi { api_key, .. }
            | Self::OpenRouter { api_key, .. }
            | Self::Gemini { api_key, .. } => api_key,
            Self::Ollama { .. } => return,
        };
        if key.is_empty() {
            if let Some(value) = lookup(var).filter(|v| !v.is_empty()) {
                *key = value;
            }
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self::Anthropic {
            api_key: String::new(),
            model: None,
            base_url: None,
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider_name())
            .field("api_key", &redact(self.credential().unwrap_or("")))
            .field("model", &self.resolved_model())
            .field("base_url", &self.base_url())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub primary: LlmConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<LlmConfig>,

    /// Per-call timeout for every LLM request
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum LLM calls per turn (tool loop bound)
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

fn default_timeout_secs() -> u64 {
    120
}
fn default_max_steps() -> u32 {
    5
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            primary: LlmConfig::default(),
            fallback: None,
            timeout_secs: default_timeout_secs(),
            max_steps: default_max_steps(),
        }
    }
}

// ── Orchestration ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Bound on `recentlyUsedTools`
    #[serde(default = "default_recent_tools_cap")]
    pub recent_tools_cap: usize,

    /// Declaration order is evaluation order
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl OrchestrationConfig {
    pub fn step_config(&self) -> StepConfig {
        StepConfig::new(self.steps.clone())
    }
}

fn default_recent_tools_cap() -> usize {
    10
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            recent_tools_cap: default_recent_tools_cap(),
            steps: Vec::new(),
        }
    }
}

// ── Gateway ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from the default path (~/.tandem/config.toml),
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_dir().join("config.toml"))
    }

    /// Load from `path`, then apply environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_overrides(&|var| std::env::var(var).ok())?;
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

    /// Apply environment overrides through `lookup`.
    ///
    /// - `TANDEM_STORAGE_BACKEND`: `memory` or `kv`
    /// - `KV_REST_API_URL` / `KV_REST_API_TOKEN`: key/value service
    /// - `TANDEM_SESSION_TTL_SECS`: session TTL override
    /// - `ANTHROPIC_API_KEY`, `OPENAI_API_KEY`, `OPENROUTER_API_KEY`,
    ///   `GEMINI_API_KEY`: fill empty credentials of the matching provider
    pub fn apply_overrides(
        &mut self,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(backend) = lookup("TANDEM_STORAGE_BACKEND") {
            self.storage.backend = backend.parse()?;
        }
        if let Some(url) = lookup("KV_REST_API_URL") {
            self.storage.url = Some(url);
        }
        if let Some(token) = lookup("KV_REST_API_TOKEN") {
            self.storage.token = Some(token);
        }
        if let Some(ttl) = lookup("TANDEM_SESSION_TTL_SECS") {
            self.storage.ttl_secs = ttl.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "TANDEM_SESSION_TTL_SECS must be a whole number of seconds, got '{ttl}'"
                ))
            })?;
        }

        self.llm.primary.fill_credential(lookup);
        if let Some(fallback) = self.llm.fallback.as_mut() {
            fallback.fill_credential(lookup);
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tandem")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "storage.ttl_secs must be > 0".into(),
            ));
        }
        if self.llm.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "llm.timeout_secs must be > 0".into(),
            ));
        }
        if self.llm.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "llm.max_steps must be > 0".into(),
            ));
        }
        if self.orchestration.recent_tools_cap == 0 {
            return Err(ConfigError::ValidationError(
                "orchestration.recent_tools_cap must be > 0".into(),
            ));
        }

        let steps = &self.orchestration.steps;
        for (i, step) in steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "orchestration step #{} has an empty name",
                    i + 1
                )));
            }
            if steps[..i].iter().any(|s| s.name == step.name) {
                return Err(ConfigError::ValidationError(format!(
                    "orchestration step '{}' is declared twice",
                    step.name
                )));
            }
            if step.sequence.iter().any(|t| t.trim().is_empty()) {
                return Err(ConfigError::ValidationError(format!(
                    "orchestration step '{}' has an empty tool name in its sequence",
                    step.name
                )));
            }
        }
        if steps.iter().filter(|s| s.is_default).count() > 1 {
            tracing::warn!("More than one default orchestration step; the first one wins");
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
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
