//! Error types for the tandem domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; `Error` is what a turn's
//! caller ultimately sees.

use thiserror::Error;

/// The top-level error type for all tandem operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Configuration errors (adapter construction) ---
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    // --- Storage errors ---
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Terminal turn failure ---
    /// Each field holds the failure of the attempt made on that adapter,
    /// `None` when no attempt was made on it.
    #[error("{}", describe_turn_failure(primary.as_deref(), fallback.as_deref()))]
    TurnFailed {
        primary: Option<String>,
        fallback: Option<String>,
    },

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_turn_failure(primary: Option<&str>, fallback: Option<&str>) -> String {
    match (primary, fallback) {
        (Some(primary), Some(fallback)) => format!(
            "Both primary and fallback LLM attempts failed. Primary: {primary}. Fallback: {fallback}"
        ),
        (Some(primary), None) => format!("LLM attempt failed: {primary}"),
        (None, Some(fallback)) => format!("Fallback LLM attempt failed: {fallback}"),
        (None, None) => "LLM attempt failed".to_string(),
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid model output: {0}")]
    InvalidOutput(String),
}

/// Raised while building an LLM adapter, before any network call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Missing credential for provider '{provider}'")]
    MissingCredential { provider: String },

    #[error("Invalid credential for provider '{provider}': expected key starting with '{expected}'")]
    InvalidCredential { provider: String, expected: String },

    #[error("Invalid model id '{model}' for provider '{provider}'")]
    InvalidModel { provider: String, model: String },

    #[error("Invalid base URL '{url}' for provider '{provider}'")]
    InvalidBaseUrl { provider: String, url: String },
}

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Storage serialization error: {0}")]
    Serialization(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Tool '{tool_name}' is not allowed in step '{step}'")]
    NotAllowed { tool_name: String, step: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}
