//! Adapter resolution: turns a turn's LLM configuration into the primary
//! and (optional) fallback adapters, and picks which one goes first.

use crate::turn::{AdapterRole, TurnLlmConfig};
use std::sync::Arc;
use std::time::Duration;
use tandem_config::LlmConfig;
use tandem_core::error::ConfigurationError;
use tandem_core::llm::Llm;
use tracing::debug;

/// Builds an adapter for one provider configuration.
pub trait AdapterFactory: Send + Sync {
    fn build(
        &self,
        config: &LlmConfig,
        timeout: Duration,
    ) -> Result<Arc<dyn Llm>, ConfigurationError>;
}

/// The production factory: real HTTP transports from `tandem-providers`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProviderAdapterFactory;

impl AdapterFactory for ProviderAdapterFactory {
    fn build(
        &self,
        config: &LlmConfig,
        timeout: Duration,
    ) -> Result<Arc<dyn Llm>, ConfigurationError> {
        let adapter = tandem_providers::build_adapter_with_timeout(config, timeout)?;
        Ok(Arc::new(adapter))
    }
}

/// The adapters available to one turn.
#[derive(Clone)]
pub struct ResolvedAdapters {
    pub primary: Arc<dyn Llm>,
    pub fallback: Option<Arc<dyn Llm>>,
    use_fallback: bool,
}

impl ResolvedAdapters {
    /// Build the primary adapter, plus a fallback only when its configuration
    /// differs from the primary in provider, credential, or resolved model.
    ///
    /// Either adapter failing validation fails the turn before any network call.
    pub fn resolve(
        factory: &dyn AdapterFactory,
        config: &TurnLlmConfig,
        timeout: Duration,
    ) -> Result<Self, ConfigurationError> {
        let primary = factory.build(&config.primary, timeout)?;

        let fallback = match &config.fallback {
            Some(fallback) if fallback.fingerprint() == config.primary.fingerprint() => {
                debug!(
                    provider = fallback.provider_name(),
                    "Fallback identical to primary, not building it"
                );
                None
            }
            Some(fallback) => Some(factory.build(fallback, timeout)?),
            None => None,
        };

        Ok(Self {
            primary,
            fallback,
            use_fallback: config.use_fallback,
        })
    }

    /// The adapter to try first.
    pub fn selected(&self) -> (AdapterRole, Arc<dyn Llm>) {
        match &self.fallback {
            Some(fallback) if self.use_fallback => (AdapterRole::Fallback, fallback.clone()),
            _ => (AdapterRole::Primary, self.primary.clone()),
        }
    }

    /// The adapter to retry with after `role` failed, if any.
    ///
    /// Only a primary failure earns a retry.
    pub fn retry_after(&self, role: AdapterRole) -> Option<Arc<dyn Llm>> {
        match role {
            AdapterRole::Primary => self.fallback.clone(),
            AdapterRole::Fallback => None,
        }
    }
}
