//! Shared test helpers: a scripted `Llm`, a counting factory, and a
//! ready-made manager over in-memory storage.

use crate::adapters::AdapterFactory;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tandem_config::LlmConfig;
use tandem_core::error::{ConfigurationError, ProviderError};
use tandem_core::llm::{GenerateObjectResult, GenerateTextResult, Llm, StreamObjectResult};
use tandem_core::message::{Message, MessageToolCall};
use tandem_core::provider::{StreamChunk, ToolDefinition};
use tandem_core::stream::{StepFinishCallback, StreamTextResult};
use tandem_core::usage::TokenUsage;
use tandem_orchestration::{OrchestrationManager, SessionStore};
use tandem_storage::InMemoryStorage;

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Plain text with the given total token count.
    Text(String, u32),
    /// Tool calls, then the loop continues.
    Tools(Vec<MessageToolCall>, u32),
    /// The call itself fails.
    Fail(ProviderError),
    /// Streaming only: some text (possibly none), then an in-band error.
    StreamError(Option<String>, ProviderError),
    /// Never answers.
    Hang,
}

pub fn text(t: &str, tokens: u32) -> Reply {
    Reply::Text(t.into(), tokens)
}

pub fn tool_call(id: &str, name: &str) -> MessageToolCall {
    MessageToolCall {
        id: id.into(),
        name: name.into(),
        arguments: "{}".into(),
    }
}

pub fn overloaded() -> ProviderError {
    ProviderError::ApiError {
        status_code: 503,
        message: "Service Unavailable".into(),
    }
}

pub fn bad_request() -> ProviderError {
    ProviderError::ApiError {
        status_code: 400,
        message: r#"{"error":{"message":"messages: field required"}}"#.into(),
    }
}

/// An `Llm` that replays a script and records what it was offered.
pub struct ScriptedLlm {
    provider: String,
    model: String,
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<usize>,
    offered: Mutex<Vec<Vec<String>>>,
    seen: Mutex<Vec<Vec<Message>>>,
    last_usage: Mutex<Option<TokenUsage>>,
}

impl ScriptedLlm {
    pub fn new(provider: &str, replies: Vec<Reply>) -> Self {
        Self {
            provider: provider.into(),
            model: format!("{provider}-model"),
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(0),
            offered: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
            last_usage: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    /// Tool names offered on each call, in call order.
    pub fn offered(&self) -> Vec<Vec<String>> {
        self.offered.lock().unwrap().clone()
    }

    /// Messages sent on each call, in call order.
    pub fn messages(&self) -> Vec<Vec<Message>> {
        self.seen.lock().unwrap().clone()
    }

    fn next(&self, messages: &[Message], tools: &[ToolDefinition]) -> Reply {
        *self.calls.lock().unwrap() += 1;
        self.seen.lock().unwrap().push(messages.to_vec());
        self.offered
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| text("ok", 1))
    }

    fn usage(&self, total: u32) -> TokenUsage {
        let usage = TokenUsage {
            prompt_tokens: total / 2,
            completion_tokens: total - total / 2,
            total_tokens: total,
            provider: self.provider.clone(),
        };
        *self.last_usage.lock().unwrap() = Some(usage.clone());
        usage
    }
}

#[async_trait]
impl Llm for ScriptedLlm {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate_text(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<GenerateTextResult, ProviderError> {
        match self.next(&messages, &tools) {
            Reply::Text(text, tokens) => Ok(GenerateTextResult {
                text,
                tool_calls: vec![],
                usage: self.usage(tokens),
            }),
            Reply::Tools(tool_calls, tokens) => Ok(GenerateTextResult {
                text: String::new(),
                tool_calls,
                usage: self.usage(tokens),
            }),
            Reply::Fail(e) | Reply::StreamError(_, e) => Err(e),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProviderError::Network("woke up".into()))
            }
        }
    }

    async fn stream_text(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        on_step_finish: Option<StepFinishCallback>,
    ) -> Result<StreamTextResult, ProviderError> {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        match self.next(&messages, &tools) {
            Reply::Text(text, tokens) => {
                let _ = tx
                    .send(Ok(StreamChunk {
                        content: Some(text),
                        ..StreamChunk::default()
                    }))
                    .await;
                let _ = tx.send(Ok(finish_chunk(tokens))).await;
            }
            Reply::Tools(tool_calls, tokens) => {
                let _ = tx
                    .send(Ok(StreamChunk {
                        tool_calls,
                        ..StreamChunk::default()
                    }))
                    .await;
                let _ = tx.send(Ok(finish_chunk(tokens))).await;
            }
            Reply::StreamError(partial, e) => {
                if let Some(partial) = partial {
                    let _ = tx
                        .send(Ok(StreamChunk {
                            content: Some(partial),
                            ..StreamChunk::default()
                        }))
                        .await;
                }
                let _ = tx.send(Err(e)).await;
            }
            Reply::Fail(e) => return Err(e),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Err(ProviderError::Network("woke up".into()));
            }
        }
        Ok(StreamTextResult::spawn(
            rx,
            self.provider.clone(),
            self.model.clone(),
            on_step_finish,
        ))
    }

    async fn generate_object(
        &self,
        _messages: Vec<Message>,
        _schema: serde_json::Value,
    ) -> Result<GenerateObjectResult, ProviderError> {
        Err(ProviderError::NotConfigured("objects are not scripted".into()))
    }

    async fn stream_object(
        &self,
        _messages: Vec<Message>,
        _schema: serde_json::Value,
    ) -> Result<StreamObjectResult, ProviderError> {
        Err(ProviderError::NotConfigured("objects are not scripted".into()))
    }

    fn last_token_usage(&self) -> Option<TokenUsage> {
        self.last_usage.lock().unwrap().clone()
    }
}

fn finish_chunk(tokens: u32) -> StreamChunk {
    StreamChunk {
        done: true,
        usage: Some(json!({ "total_tokens": tokens })),
        ..StreamChunk::default()
    }
}

/// Hands out pre-registered `ScriptedLlm`s by provider name and counts builds.
#[derive(Default)]
pub struct CountingFactory {
    adapters: HashMap<&'static str, Arc<ScriptedLlm>>,
    builds: Mutex<usize>,
}

impl CountingFactory {
    pub fn with(mut self, provider: &'static str, llm: Arc<ScriptedLlm>) -> Self {
        self.adapters.insert(provider, llm);
        self
    }

    pub fn builds(&self) -> usize {
        *self.builds.lock().unwrap()
    }
}

impl AdapterFactory for CountingFactory {
    fn build(
        &self,
        config: &LlmConfig,
        _timeout: Duration,
    ) -> Result<Arc<dyn Llm>, ConfigurationError> {
        *self.builds.lock().unwrap() += 1;
        let name = config.provider_name();
        let llm = self
            .adapters
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::new(ScriptedLlm::new(name, vec![])));
        Ok(llm)
    }
}

pub fn anthropic(key: &str, model: Option<&str>) -> LlmConfig {
    LlmConfig::Anthropic {
        api_key: key.into(),
        model: model.map(String::from),
        base_url: None,
    }
}

pub fn openai(key: &str, model: Option<&str>) -> LlmConfig {
    LlmConfig::OpenAi {
        api_key: key.into(),
        model: model.map(String::from),
        base_url: None,
    }
}

pub fn manager() -> Arc<OrchestrationManager> {
    let store = SessionStore::new(Arc::new(InMemoryStorage::new()), Duration::from_secs(1800));
    Arc::new(OrchestrationManager::new(store))
}
