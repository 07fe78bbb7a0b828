//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly (not OpenAI-compatible proxy).
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Streaming via SSE with `content_block_delta` events; `error` events
//!   are forwarded as in-band `Err` items
//! - Structured output through a schema instruction in the system prompt

use crate::http::{SseBuffer, error_from_response, send_error};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tandem_core::error::ProviderError;
use tandem_core::message::{Message, MessageToolCall, Role};
use tandem_core::provider::*;
use tokio::sync::mpsc;
use tracing::{debug, trace};

const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            name: "anthropic".into(),
            base_url: ANTHROPIC_BASE_URL.into(),
            api_key: api_key.into(),
            client: build_client(Duration::from_secs(300)),
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    /// Extract system messages from the message list.
    /// Anthropic puts system prompt as a top-level field, not in messages.
    fn extract_system(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut non_system: Vec<&Message> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system_parts.push(&msg.content),
                _ => non_system.push(msg),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        (system, non_system)
    }

    /// Convert messages to Anthropic API format with content blocks.
    fn to_api_messages(messages: &[&Message]) -> Vec<AnthropicMessage> {
        let mut result = Vec::new();

        for msg in messages {
            match msg.role {
                Role::User => {
                    result.push(AnthropicMessage {
                        role: "user".into(),
                        content: AnthropicContent::Text(msg.content.clone()),
                    });
                }
                Role::Assistant => {
                    if msg.tool_calls.is_empty() {
                        result.push(AnthropicMessage {
                            role: "assistant".into(),
                            content: AnthropicContent::Text(msg.content.clone()),
                        });
                    } else {
                        let mut blocks: Vec<ContentBlock> = Vec::new();
                        if !msg.content.is_empty() {
                            blocks.push(ContentBlock::Text {
                                text: msg.content.clone(),
                            });
                        }
                        for tc in &msg.tool_calls {
                            let input: Value =
                                serde_json::from_str(&tc.arguments).unwrap_or_else(|_| json!({}));
                            blocks.push(ContentBlock::ToolUse {
                                id: tc.id.clone(),
                                name: tc.name.clone(),
                                input,
                            });
                        }
                        result.push(AnthropicMessage {
                            role: "assistant".into(),
                            content: AnthropicContent::Blocks(blocks),
                        });
                    }
                }
                Role::Tool => {
                    result.push(AnthropicMessage {
                        role: "user".into(),
                        content: AnthropicContent::Blocks(vec![ContentBlock::ToolResult {
                            tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                            content: msg.content.clone(),
                        }]),
                    });
                }
                Role::System => {} // handled separately
            }
        }

        result
    }

    /// Convert tool definitions to Anthropic format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> Value {
        let (system, messages) = Self::extract_system(&request.messages);

        // The Messages API has no response_format; the schema goes into the
        // system prompt instead.
        let system = match &request.response_schema {
            Some(schema) => {
                let instruction = format!(
                    "Respond with a single JSON value that satisfies this JSON Schema, \
                     and nothing else:\n{schema}"
                );
                Some(match system {
                    Some(s) => format!("{s}\n\n{instruction}"),
                    None => instruction,
                })
            }
            None => system,
        };

        let mut body = json!({
            "model": request.model,
            "messages": Self::to_api_messages(&messages),
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature,
        });
        if stream {
            body["stream"] = json!(true);
        }
        if let Some(sys) = system {
            body["system"] = json!(sys);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(Self::to_api_tools(&request.tools));
        }
        body
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    /// Convert Anthropic API response to our ProviderResponse.
    fn response_to_provider_response(resp: AnthropicResponse) -> ProviderResponse {
        let mut text_content = String::new();
        let mut tool_calls = Vec::new();

        for block in resp.content {
            match block {
                ResponseContentBlock::Text { text } => {
                    if !text_content.is_empty() {
                        text_content.push('\n');
                    }
                    text_content.push_str(&text);
                }
                ResponseContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(MessageToolCall {
                        id,
                        name,
                        arguments: input.to_string(),
                    });
                }
                ResponseContentBlock::Other => {}
            }
        }

        ProviderResponse {
            message: Message::assistant_with_tool_calls(text_content, tool_calls),
            usage: resp.usage,
            model: resp.model,
        }
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// HTTP status equivalent of an Anthropic error `type`, for classification.
fn status_for_error_type(error_type: &str) -> u16 {
    match error_type {
        "invalid_request_error" => 400,
        "authentication_error" => 401,
        "permission_error" => 403,
        "not_found_error" => 404,
        "request_too_large" => 413,
        "rate_limit_error" => 429,
        "api_error" => 500,
        "overloaded_error" => 529,
        _ => 0,
    }
}

/// State carried across SSE events while a message streams.
#[derive(Default)]
struct StreamState {
    current_tool: Option<MessageToolCall>,
    tool_calls: Vec<MessageToolCall>,
    /// Usage fields merged from `message_start` and `message_delta`
    usage: Map<String, Value>,
}

impl StreamState {
    fn finish_tool(&mut self) {
        if let Some(tool) = self.current_tool.take() {
            self.tool_calls.push(tool);
        }
    }

    fn merge_usage(&mut self, usage: Option<&Value>) {
        if let Some(Value::Object(fields)) = usage {
            for (key, value) in fields {
                self.usage.insert(key.clone(), value.clone());
            }
        }
    }

    fn final_chunk(&mut self) -> StreamChunk {
        self.finish_tool();
        StreamChunk {
            content: None,
            tool_calls: std::mem::take(&mut self.tool_calls),
            done: true,
            usage: if self.usage.is_empty() {
                None
            } else {
                Some(Value::Object(std::mem::take(&mut self.usage)))
            },
        }
    }

    /// Apply one event. Returns a chunk to forward, if any, and whether the
    /// stream is over.
    fn apply(&mut self, event: &Value, raw: &str) -> (Option<Result<StreamChunk, ProviderError>>, bool) {
        match event["type"].as_str().unwrap_or("") {
            "message_start" => {
                self.merge_usage(event.pointer("/message/usage"));
                (None, false)
            }
            "content_block_start" => {
                let block = &event["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    self.finish_tool();
                    self.current_tool = Some(MessageToolCall {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        arguments: String::new(),
                    });
                }
                (None, false)
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let chunk = delta["text"].as_str().map(|text| {
                            Ok(StreamChunk {
                                content: Some(text.to_string()),
                                ..StreamChunk::default()
                            })
                        });
                        (chunk, false)
                    }
                    "input_json_delta" => {
                        if let (Some(tool), Some(partial)) =
                            (self.current_tool.as_mut(), delta["partial_json"].as_str())
                        {
                            tool.arguments.push_str(partial);
                        }
                        (None, false)
                    }
                    _ => (None, false),
                }
            }
            "content_block_stop" => {
                self.finish_tool();
                (None, false)
            }
            "message_delta" => {
                self.merge_usage(event.get("usage"));
                (None, false)
            }
            "message_stop" => (Some(Ok(self.final_chunk())), true),
            "error" => {
                let error_type = event.pointer("/error/type").and_then(Value::as_str).unwrap_or("");
                let error = ProviderError::ApiError {
                    status_code: status_for_error_type(error_type),
                    message: raw.to_string(),
                };
                (Some(Err(error)), true)
            }
            _ => (None, false),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = Self::request_body(&request, false);

        debug!(provider = "anthropic", model = %request.model, "Sending completion request");

        let response = self.post(&url).json(&body).send().await.map_err(send_error)?;

        if !response.status().is_success() {
            return Err(error_from_response(&self.name, response).await);
        }

        let api_resp: AnthropicResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse Anthropic response: {e}"),
            })?;

        Ok(Self::response_to_provider_response(api_resp))
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = Self::request_body(&request, true);

        debug!(provider = "anthropic", model = %request.model, "Sending streaming request");

        let response = self
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(send_error)?;

        if !response.status().is_success() {
            return Err(error_from_response(&self.name, response).await);
        }

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut sse = SseBuffer::default();
            let mut state = StreamState::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for data in sse.push(&bytes) {
                    let event: Value = match serde_json::from_str(&data) {
                        Ok(v) => v,
                        Err(e) => {
                            trace!(error = %e, data = %data, "Ignoring unparseable Anthropic SSE");
                            continue;
                        }
                    };

                    let (chunk, done) = state.apply(&event, &data);
                    if let Some(chunk) = chunk {
                        if tx.send(chunk).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                    if done {
                        return;
                    }
                }
            }

            // Stream ended without message_stop
            let _ = tx.send(Ok(state.final_chunk())).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(send_error)?;

        // 200 = works, 401 = bad key, anything else = reachable but error
        Ok(response.status().is_success() || response.status().as_u16() != 401)
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<ResponseContentBlock>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::usage::TokenUsage;

    fn apply_all(events: &[&str]) -> Vec<Result<StreamChunk, ProviderError>> {
        let mut state = StreamState::default();
        let mut out = Vec::new();
        for raw in events {
            let event: Value = serde_json::from_str(raw).unwrap();
            let (chunk, done) = state.apply(&event, raw);
            out.extend(chunk);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn constructor_with_base_url() {
        let provider = AnthropicProvider::new("sk-ant-test").with_base_url("https://custom.proxy.com/");
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.base_url, "https://custom.proxy.com");
    }

    #[test]
    fn system_extraction() {
        let messages = vec![
            Message::system("You are helpful"),
            Message::system("Be concise"),
            Message::user("Hello"),
            Message::assistant("Hi!"),
        ];

        let (system, non_system) = AnthropicProvider::extract_system(&messages);
        assert_eq!(system.as_deref(), Some("You are helpful\n\nBe concise"));
        assert_eq!(non_system.len(), 2);
        assert_eq!(non_system[0].role, Role::User);
    }

    #[test]
    fn message_conversion_with_tool_calls_and_results() {
        let call = Message::assistant_with_tool_calls(
            "Let me search",
            vec![MessageToolCall {
                id: "toolu_123".into(),
                name: "web_search".into(),
                arguments: r#"{"query":"rust"}"#.into(),
            }],
        );
        let result = Message::tool_result("toolu_123", "search results here");
        let api_msgs = AnthropicProvider::to_api_messages(&[&call, &result]);

        match &api_msgs[0].content {
            AnthropicContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(&blocks[1], ContentBlock::ToolUse { name, .. } if name == "web_search"));
            }
            _ => panic!("Expected blocks content"),
        }
        assert_eq!(api_msgs[1].role, "user");
        match &api_msgs[1].content {
            AnthropicContent::Blocks(blocks) => assert!(matches!(
                &blocks[0],
                ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "toolu_123"
            )),
            _ => panic!("Expected blocks content"),
        }
    }

    #[test]
    fn schema_becomes_system_instruction() {
        let request = ProviderRequest::new(
            "claude-sonnet-4-20250514",
            vec![Message::system("Be terse"), Message::user("Give me a point")],
        )
        .with_response_schema(json!({"type": "object", "required": ["x", "y"]}));

        let body = AnthropicProvider::request_body(&request, false);
        let system = body["system"].as_str().unwrap();
        assert!(system.starts_with("Be terse"));
        assert!(system.contains("JSON Schema"));
        assert!(system.contains("\"required\""));
        assert!(body.get("stream").is_none());
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn parse_tool_use_response_keeps_vendor_usage() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{
                "id": "msg_02",
                "model": "claude-sonnet-4-20250514",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "Let me calculate"},
                    {"type": "tool_use", "id": "toolu_abc", "name": "calculator", "input": {"expression": "2+2"}}
                ],
                "usage": {"input_tokens": 20, "output_tokens": 10},
                "stop_reason": "tool_use"
            }"#,
        )
        .unwrap();

        let pr = AnthropicProvider::response_to_provider_response(resp);
        assert_eq!(pr.message.content, "Let me calculate");
        assert_eq!(pr.message.tool_calls[0].id, "toolu_abc");
        let args: Value = serde_json::from_str(&pr.message.tool_calls[0].arguments).unwrap();
        assert_eq!(args["expression"], "2+2");

        let usage = TokenUsage::from_vendor(&pr.usage.unwrap(), "anthropic");
        assert_eq!(usage.total_tokens, 30);
    }

    #[test]
    fn stream_events_assemble_text_tools_and_usage() {
        let chunks = apply_all(&[
            r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"search"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
            r#"{"type":"content_block_stop","index":1}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
            r#"{"type":"message_stop"}"#,
        ]);

        assert_eq!(chunks.len(), 2);
        let text = chunks[0].as_ref().unwrap();
        assert_eq!(text.content.as_deref(), Some("Hi"));

        let last = chunks[1].as_ref().unwrap();
        assert!(last.done);
        assert_eq!(last.tool_calls[0].name, "search");
        assert_eq!(last.tool_calls[0].arguments, r#"{"q":"rust"}"#);
        let usage = TokenUsage::from_vendor(last.usage.as_ref().unwrap(), "anthropic");
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 9);
        assert_eq!(usage.total_tokens, 21);
    }

    #[test]
    fn stream_error_event_is_in_band() {
        let chunks = apply_all(&[
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"par"}}"#,
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"never"}}"#,
        ]);
        assert_eq!(chunks.len(), 2);
        match &chunks[1] {
            Err(ProviderError::ApiError { status_code, message }) => {
                assert_eq!(*status_code, 529);
                assert!(message.contains("Overloaded"));
            }
            other => panic!("expected in-band API error, got {other:?}"),
        }
    }
}
