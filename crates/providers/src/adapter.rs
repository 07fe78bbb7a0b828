//! LLM adapter: binds one provider and model and implements [`Llm`].
//!
//! Beyond delegation, the adapter normalizes every vendor usage object into
//! a `TokenUsage` and remembers the most recent one.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tandem_core::error::ProviderError;
use tandem_core::llm::{
    GenerateObjectResult, GenerateTextResult, Llm, StreamObjectResult, parse_json_output,
};
use tandem_core::message::Message;
use tandem_core::provider::{Provider, ProviderRequest, ToolDefinition};
use tandem_core::stream::{StepFinish, StepFinishCallback, StreamTextResult};
use tandem_core::usage::TokenUsage;
use tracing::debug;

pub struct LlmAdapter {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    last_usage: Arc<Mutex<Option<TokenUsage>>>,
}

impl LlmAdapter {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: None,
            max_tokens: None,
            last_usage: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn request(&self, messages: Vec<Message>) -> ProviderRequest {
        let mut request = ProviderRequest::new(&self.model, messages);
        if let Some(temperature) = self.temperature {
            request.temperature = temperature;
        }
        request.max_tokens = self.max_tokens;
        request
    }

    fn observe(&self, raw: Option<&Value>) -> TokenUsage {
        let usage = match raw {
            Some(raw) => TokenUsage::from_vendor(raw, self.provider.name()),
            None => TokenUsage::zero(self.provider.name()),
        };
        store_usage(&self.last_usage, usage.clone());
        usage
    }

    /// Callback that records the stream's usage, then runs the caller's.
    fn usage_recorder(&self, inner: Option<StepFinishCallback>) -> StepFinishCallback {
        let last_usage = self.last_usage.clone();
        let provider = self.provider.name().to_string();
        Arc::new(move |finish: &StepFinish| {
            let usage = finish
                .usage
                .clone()
                .unwrap_or_else(|| TokenUsage::zero(provider.as_str()));
            store_usage(&last_usage, usage);
            if let Some(inner) = &inner {
                inner(finish);
            }
        })
    }
}

fn store_usage(cell: &Mutex<Option<TokenUsage>>, usage: TokenUsage) {
    *cell.lock().unwrap_or_else(|e| e.into_inner()) = Some(usage);
}

#[async_trait]
impl Llm for LlmAdapter {
    fn provider_name(&self) -> &str {
        self.provider.name()
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate_text(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<GenerateTextResult, ProviderError> {
        let request = self.request(messages).with_tools(tools);
        let response = self.provider.complete(request).await?;
        let usage = self.observe(response.usage.as_ref());

        debug!(
            provider = %self.provider.name(),
            model = %response.model,
            total_tokens = usage.total_tokens,
            tool_calls = response.message.tool_calls.len(),
            "Text generated"
        );

        Ok(GenerateTextResult {
            text: response.message.content,
            tool_calls: response.message.tool_calls,
            usage,
        })
    }

    async fn stream_text(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        on_step_finish: Option<StepFinishCallback>,
    ) -> Result<StreamTextResult, ProviderError> {
        let mut request = self.request(messages).with_tools(tools);
        request.stream = true;
        let chunks = self.provider.stream(request).await?;
        Ok(StreamTextResult::spawn(
            chunks,
            self.provider.name(),
            self.model.clone(),
            Some(self.usage_recorder(on_step_finish)),
        ))
    }

    async fn generate_object(
        &self,
        messages: Vec<Message>,
        schema: Value,
    ) -> Result<GenerateObjectResult, ProviderError> {
        let request = self.request(messages).with_response_schema(schema);
        let response = self.provider.complete(request).await?;
        let usage = self.observe(response.usage.as_ref());
        let object = parse_json_output(&response.message.content)?;
        Ok(GenerateObjectResult { object, usage })
    }

    async fn stream_object(
        &self,
        messages: Vec<Message>,
        schema: Value,
    ) -> Result<StreamObjectResult, ProviderError> {
        let mut request = self.request(messages).with_response_schema(schema);
        request.stream = true;
        let chunks = self.provider.stream(request).await?;
        Ok(StreamObjectResult::new(StreamTextResult::spawn(
            chunks,
            self.provider.name(),
            self.model.clone(),
            Some(self.usage_recorder(None)),
        )))
    }

    fn last_token_usage(&self) -> Option<TokenUsage> {
        self.last_usage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
