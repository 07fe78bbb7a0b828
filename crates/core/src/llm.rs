//! The LLM contract.
//!
//! Everything above the vendor transport talks to a model through `Llm`:
//! the agent execution node, and any tool that needs a model of its own.
//! Every operation reports normalized `TokenUsage`.

use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall};
use crate::provider::ToolDefinition;
use crate::stream::{StepFinishCallback, StreamTextResult};
use crate::usage::TokenUsage;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Result of a non-streaming text generation.
#[derive(Debug, Clone)]
pub struct GenerateTextResult {
    pub text: String,
    pub tool_calls: Vec<MessageToolCall>,
    pub usage: TokenUsage,
}

/// Result of a structured generation.
#[derive(Debug, Clone)]
pub struct GenerateObjectResult {
    pub object: serde_json::Value,
    pub usage: TokenUsage,
}

/// A structured generation being streamed: partial JSON text now, the
/// parsed object once the stream ends.
pub struct StreamObjectResult {
    inner: StreamTextResult,
}

impl StreamObjectResult {
    pub fn new(inner: StreamTextResult) -> Self {
        Self { inner }
    }

    /// Raw JSON text as it arrives. Can be taken once.
    pub fn partial_text(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.inner.text_stream()
    }

    pub fn has_error(&self) -> bool {
        self.inner.has_error()
    }

    /// Wait for the stream to end and parse the accumulated text.
    pub async fn into_object(self) -> Result<GenerateObjectResult, ProviderError> {
        let provider = self.inner.provider().to_string();
        let response = self.inner.into_response().await;
        if let Some(failure) = response.error {
            return Err(ProviderError::StreamInterrupted(failure.message));
        }
        let object = parse_json_output(&response.text)?;
        Ok(GenerateObjectResult {
            object,
            usage: response.usage.unwrap_or_else(|| TokenUsage::zero(provider)),
        })
    }
}

/// The LLM contract, bound to one provider and model.
#[async_trait]
pub trait Llm: Send + Sync {
    fn provider_name(&self) -> &str;

    fn model(&self) -> &str;

    async fn generate_text(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<GenerateTextResult, ProviderError>;

    async fn stream_text(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        on_step_finish: Option<StepFinishCallback>,
    ) -> Result<StreamTextResult, ProviderError>;

    async fn generate_object(
        &self,
        messages: Vec<Message>,
        schema: serde_json::Value,
    ) -> Result<GenerateObjectResult, ProviderError>;

    async fn stream_object(
        &self,
        messages: Vec<Message>,
        schema: serde_json::Value,
    ) -> Result<StreamObjectResult, ProviderError>;

    /// The most recent usage observation, if any call has completed.
    fn last_token_usage(&self) -> Option<TokenUsage>;
}

/// Parse model output as JSON, tolerating a surrounding markdown fence.
pub fn parse_json_output(text: &str) -> Result<serde_json::Value, ProviderError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body)
        .map_err(|e| ProviderError::InvalidOutput(format!("expected JSON object: {e}")))
}
