//! LLM provider implementations for tandem.
//!
//! Vendor transports implement `tandem_core::Provider`; [`LlmAdapter`]
//! wraps one of them as a `tandem_core::Llm`. The factory builds both from
//! an `LlmConfig`.

pub mod adapter;
pub mod anthropic;
pub mod factory;
mod http;
pub mod openai_compat;

pub use adapter::LlmAdapter;
pub use anthropic::AnthropicProvider;
pub use factory::{build_adapter, build_adapter_with_timeout, build_provider, validate};
pub use openai_compat::OpenAiCompatProvider;
