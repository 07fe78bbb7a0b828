//! Adapter factory: turns an `LlmConfig` into a ready `LlmAdapter`.
//!
//! Credentials, model id, and base URL are validated here, before any
//! network call, so misconfiguration fails fast with a typed error.

use crate::adapter::LlmAdapter;
use crate::anthropic::AnthropicProvider;
use crate::openai_compat::OpenAiCompatProvider;
use std::sync::Arc;
use std::time::Duration;
use tandem_config::LlmConfig;
use tandem_core::error::ConfigurationError;
use tandem_core::provider::Provider;
use tracing::debug;

/// Required API key prefix for a provider, if it has one.
pub fn credential_prefix(provider: &str) -> Option<&'static str> {
    match provider {
        "anthropic" => Some("sk-ant-"),
        "openai" => Some("sk-"),
        "openrouter" => Some("sk-or-"),
        "gemini" => Some("AIza"),
        _ => None,
    }
}

/// Get the default base URL for the supported providers.
pub fn default_base_url(provider: &str) -> &'static str {
    match provider {
        "anthropic" => crate::anthropic::ANTHROPIC_BASE_URL,
        "openrouter" => crate::openai_compat::OPENROUTER_BASE_URL,
        "gemini" => crate::openai_compat::GEMINI_BASE_URL,
        "ollama" => crate::openai_compat::OLLAMA_BASE_URL,
        _ => crate::openai_compat::OPENAI_BASE_URL,
    }
}

/// Check a configuration without building anything.
pub fn validate(config: &LlmConfig) -> Result<(), ConfigurationError> {
    let provider = config.provider_name();

    if let Some(key) = config.credential() {
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigurationError::MissingCredential {
                provider: provider.into(),
            });
        }
        if let Some(prefix) = credential_prefix(provider) {
            if !key.starts_with(prefix) {
                return Err(ConfigurationError::InvalidCredential {
                    provider: provider.into(),
                    expected: prefix.into(),
                });
            }
        }
    }

    let model = config.resolved_model();
    if model.is_empty() || model.chars().any(char::is_whitespace) {
        return Err(ConfigurationError::InvalidModel {
            provider: provider.into(),
            model,
        });
    }

    if let Some(url) = config.base_url() {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigurationError::InvalidBaseUrl {
                provider: provider.into(),
                url: url.into(),
            });
        }
    }

    Ok(())
}

/// Build the vendor transport for a configuration.
pub fn build_provider(
    config: &LlmConfig,
    timeout: Duration,
) -> Result<Arc<dyn Provider>, ConfigurationError> {
    validate(config)?;

    let provider: Arc<dyn Provider> = match config {
        LlmConfig::Anthropic {
            api_key, base_url, ..
        } => {
            let mut p = AnthropicProvider::new(api_key.trim()).with_timeout(timeout);
            if let Some(url) = base_url {
                p = p.with_base_url(url);
            }
            Arc::new(p)
        }
        LlmConfig::OpenAi {
            api_key, base_url, ..
        } => Arc::new(
            OpenAiCompatProvider::new(
                "openai",
                base_url.as_deref().unwrap_or(default_base_url("openai")),
                api_key.trim(),
            )
            .with_timeout(timeout),
        ),
        LlmConfig::OpenRouter { api_key, .. } => {
            Arc::new(OpenAiCompatProvider::openrouter(api_key.trim()).with_timeout(timeout))
        }
        LlmConfig::Gemini { api_key, .. } => {
            Arc::new(OpenAiCompatProvider::gemini(api_key.trim()).with_timeout(timeout))
        }
        LlmConfig::Ollama { base_url, .. } => {
            Arc::new(OpenAiCompatProvider::ollama(base_url.as_deref()).with_timeout(timeout))
        }
    };
    Ok(provider)
}

/// Build an adapter bound to the configuration's provider and resolved model.
pub fn build_adapter(config: &LlmConfig) -> Result<LlmAdapter, ConfigurationError> {
    build_adapter_with_timeout(config, Duration::from_secs(120))
}

pub fn build_adapter_with_timeout(
    config: &LlmConfig,
    timeout: Duration,
) -> Result<LlmAdapter, ConfigurationError> {
    let provider = build_provider(config, timeout)?;
    let model = config.resolved_model();
    debug!(provider = config.provider_name(), model = %model, "LLM adapter built");
    Ok(LlmAdapter::new(provider, model))
}
