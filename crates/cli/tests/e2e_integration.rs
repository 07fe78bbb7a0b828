//! End-to-end tests for tandem.
//!
//! These tests load a real config file, wire storage, the orchestration
//! manager and the agent node the way the gateway does, and drive the HTTP
//! router with scripted models standing in for the vendors.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use tandem_agent::{AdapterFactory, AgentNode, TurnLlmConfig, TurnRequest};
use tandem_config::{AppConfig, LlmConfig};
use tandem_core::error::{ConfigurationError, ProviderError, ToolError};
use tandem_core::llm::{GenerateObjectResult, GenerateTextResult, Llm, StreamObjectResult};
use tandem_core::message::{Message, MessageToolCall};
use tandem_core::provider::{StreamChunk, ToolDefinition};
use tandem_core::stream::{StepFinishCallback, StreamTextResult};
use tandem_core::tool::{Tool, ToolContext, ToolRegistry, ToolResult};
use tandem_core::usage::TokenUsage;
use tandem_gateway::{GatewayState, SharedState, build_manager, build_router};

// ── Scripted model ───────────────────────────────────────────────────────

type Reply = Result<(String, Vec<MessageToolCall>, u32), ProviderError>;

/// Answers calls from a script, in order, and records the tools it was offered.
struct ScriptedLlm {
    provider: &'static str,
    replies: Mutex<VecDeque<Reply>>,
    offered: Mutex<Vec<Vec<String>>>,
}

impl ScriptedLlm {
    fn new(provider: &'static str, replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            replies: Mutex::new(replies.into()),
            offered: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.offered.lock().unwrap().len()
    }

    fn offered(&self) -> Vec<Vec<String>> {
        self.offered.lock().unwrap().clone()
    }

    fn next(&self, tools: &[ToolDefinition]) -> Reply {
        self.offered
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("{} script exhausted", self.provider))
    }

    fn usage(&self, total: u32) -> TokenUsage {
        TokenUsage {
            prompt_tokens: total - total / 2,
            completion_tokens: total / 2,
            total_tokens: total,
            provider: self.provider.into(),
        }
    }
}

fn says(text: &str, tokens: u32) -> Reply {
    Ok((text.into(), vec![], tokens))
}

fn calls_tool(id: &str, name: &str, tokens: u32) -> Reply {
    Ok((
        String::new(),
        vec![MessageToolCall {
            id: id.into(),
            name: name.into(),
            arguments: r#"{"query":"rust"}"#.into(),
        }],
        tokens,
    ))
}

fn overloaded() -> Reply {
    Err(ProviderError::ApiError {
        status_code: 503,
        message: "Service Unavailable".into(),
    })
}

#[async_trait]
impl Llm for ScriptedLlm {
    fn provider_name(&self) -> &str {
        self.provider
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn generate_text(
        &self,
        _messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<GenerateTextResult, ProviderError> {
        let (text, tool_calls, tokens) = self.next(&tools)?;
        Ok(GenerateTextResult {
            text,
            tool_calls,
            usage: self.usage(tokens),
        })
    }

    async fn stream_text(
        &self,
        _messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        on_step_finish: Option<StepFinishCallback>,
    ) -> Result<StreamTextResult, ProviderError> {
        let (text, tool_calls, tokens) = self.next(&tools)?;
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let _ = tx
            .send(Ok(StreamChunk {
                content: Some(text),
                tool_calls,
                ..StreamChunk::default()
            }))
            .await;
        let _ = tx
            .send(Ok(StreamChunk {
                done: true,
                usage: Some(json!({
                    "prompt_tokens": tokens - tokens / 2,
                    "completion_tokens": tokens / 2,
                })),
                ..StreamChunk::default()
            }))
            .await;
        Ok(StreamTextResult::spawn(rx, self.provider, "scripted", on_step_finish))
    }

    async fn generate_object(
        &self,
        _messages: Vec<Message>,
        _schema: Value,
    ) -> Result<GenerateObjectResult, ProviderError> {
        Err(ProviderError::NotConfigured("structured output not scripted".into()))
    }

    async fn stream_object(
        &self,
        _messages: Vec<Message>,
        _schema: Value,
    ) -> Result<StreamObjectResult, ProviderError> {
        Err(ProviderError::NotConfigured("structured output not scripted".into()))
    }

    fn last_token_usage(&self) -> Option<TokenUsage> {
        None
    }
}

/// Hands out the scripted model registered for each provider.
struct ScriptedFactory {
    primary: Arc<ScriptedLlm>,
    fallback: Arc<ScriptedLlm>,
}

impl AdapterFactory for ScriptedFactory {
    fn build(
        &self,
        config: &LlmConfig,
        _timeout: Duration,
    ) -> Result<Arc<dyn Llm>, ConfigurationError> {
        tandem_providers::validate(config)?;
        Ok(match config.provider_name() {
            "anthropic" => self.primary.clone(),
            _ => self.fallback.clone(),
        })
    }
}

// ── Tools ────────────────────────────────────────────────────────────────

struct NamedTool(&'static str);

#[async_trait]
impl Tool for NamedTool {
    fn name(&self) -> &str {
        self.0
    }

    fn description(&self) -> &str {
        "test tool"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"query": {"type": "string"}}})
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        assert!(context.llm.is_some(), "tools receive the serving model");
        Ok(ToolResult {
            call_id: context.tool_call_id.clone(),
            success: true,
            output: format!("{} ran with {arguments}", self.0),
            data: None,
        })
    }
}

fn tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(NamedTool("search")));
    registry.register(Arc::new(NamedTool("summarize")));
    registry
}

// ── Wiring ───────────────────────────────────────────────────────────────

const CONFIG: &str = r#"
[storage]
backend = "memory"
ttl_secs = 600

[llm]
timeout_secs = 30
max_steps = 4

[llm.primary]
provider = "anthropic"
api_key = "sk-ant-e2e"

[llm.fallback]
provider = "openai"
api_key = "sk-e2e"
model = "gpt-4o-mini"

[[orchestration.steps]]
name = "answer"
conditions = [{ type = "tool_used", tool = "summarize" }]
available_tools = { denied = ["search", "summarize"] }

[[orchestration.steps]]
name = "gather"
is_default = true
sequence = ["search", "summarize"]
"#;

fn load_config(toml: &str) -> AppConfig {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(toml.as_bytes()).unwrap();
    AppConfig::load_from(file.path()).unwrap()
}

fn wire(config: &AppConfig, primary: Arc<ScriptedLlm>, fallback: Arc<ScriptedLlm>) -> SharedState {
    let node = AgentNode::new(Arc::new(build_manager(config)), Arc::new(tools()))
        .with_factory(Arc::new(ScriptedFactory { primary, fallback }))
        .with_timeout(Duration::from_secs(config.llm.timeout_secs))
        .with_max_steps(config.llm.max_steps);
    Arc::new(GatewayState {
        node: Arc::new(node),
        llm: TurnLlmConfig::from(&config.llm),
        steps: config.orchestration.step_config(),
    })
}

fn chat(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn header_json(response: &axum::response::Response, name: &str) -> Value {
    let raw = response.headers().get(name).unwrap().to_str().unwrap();
    serde_json::from_str(raw).unwrap()
}

// ── Tests ────────────────────────────────────────────────────────────────

#[test]
fn config_file_drives_wiring() {
    let config = load_config(CONFIG);
    assert_eq!(config.storage.ttl_secs, 600);
    assert_eq!(config.llm.max_steps, 4);
    assert_eq!(config.llm.fallback.as_ref().unwrap().resolved_model(), "gpt-4o-mini");
    assert_eq!(config.orchestration.steps.len(), 2);

    let manager = build_manager(&config);
    assert_eq!(manager.store().ttl(), Duration::from_secs(600));
    assert_eq!(manager.store().storage_name(), "memory");
}

#[test]
fn misconfigured_kv_storage_degrades_to_memory() {
    let config = load_config("[storage]\nbackend = \"kv\"\n");
    assert_eq!(build_manager(&config).store().storage_name(), "memory");
}

#[test]
fn environment_fills_empty_credentials() {
    let mut config = load_config(
        "[llm.primary]\nprovider = \"anthropic\"\n\n[llm.fallback]\nprovider = \"gemini\"\n",
    );
    config
        .apply_overrides(&|var| match var {
            "ANTHROPIC_API_KEY" => Some("sk-ant-from-env".into()),
            "GEMINI_API_KEY" => Some("AIza-from-env".into()),
            "TANDEM_SESSION_TTL_SECS" => Some("90".into()),
            _ => None,
        })
        .unwrap();

    assert_eq!(config.llm.primary.credential(), Some("sk-ant-from-env"));
    assert_eq!(config.llm.fallback.unwrap().credential(), Some("AIza-from-env"));
    assert_eq!(config.storage.ttl_secs, 90);
}

#[tokio::test]
async fn tool_sequence_moves_session_to_next_step() {
    let config = load_config(CONFIG);
    let primary = ScriptedLlm::new(
        "anthropic",
        vec![
            calls_tool("c1", "search", 10),
            calls_tool("c2", "summarize", 10),
            says("Rust is a systems language.", 10),
        ],
    );
    let fallback = ScriptedLlm::new("openai", vec![]);
    let app = build_router(wire(&config, primary.clone(), fallback.clone()));

    let response = app
        .oneshot(chat(json!({"session_id": "e2e-1", "message": "tell me about rust"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-session-id"], "e2e-1");

    let state = header_json(&response, "x-orchestration-state");
    assert_eq!(state["recentlyUsedTools"], json!(["summarize", "search"]));
    assert_eq!(state["activeStep"], "answer");
    assert_eq!(state["sequenceIndex"], 0);

    let body = json_body(response).await;
    assert_eq!(body["text"], "Rust is a systems language.");
    assert_eq!(body["served_by"], "primary");
    assert_eq!(body["tool_calls_made"], 2);
    assert_eq!(body["usage"]["totalTokens"], 30);

    assert_eq!(
        primary.offered(),
        vec![
            vec!["search".to_string()],
            vec!["summarize".to_string()],
            Vec::<String>::new(),
        ]
    );
    assert_eq!(fallback.calls(), 0);
}

#[tokio::test]
async fn primary_outage_is_served_by_fallback_and_accounted() {
    let config = load_config(CONFIG);
    let primary = ScriptedLlm::new("anthropic", vec![overloaded()]);
    let fallback = ScriptedLlm::new("openai", vec![says("from the fallback", 12)]);
    let state = wire(&config, primary.clone(), fallback.clone());
    let app = build_router(state.clone());

    let response = app
        .clone()
        .oneshot(chat(json!({
            "session_id": "e2e-2",
            "messages": [{"role": "user", "content": "hello"}],
            "tools": [],
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["served_by"], "fallback");
    assert_eq!(body["provider"], "openai");
    assert_eq!(primary.calls(), 1);
    assert_eq!(fallback.calls(), 1);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/sessions/e2e-2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session = json_body(response).await;
    assert_eq!(session["cumulativeTokenUsage"]["totalTokens"], 12);
    assert_eq!(session["cumulativeTokenUsage"]["calls"], 1);
}

#[tokio::test]
async fn both_models_down_is_a_gateway_error_without_usage() {
    let config = load_config(CONFIG);
    let primary = ScriptedLlm::new("anthropic", vec![overloaded()]);
    let fallback = ScriptedLlm::new(
        "openai",
        vec![Err(ProviderError::Network("connection refused".into()))],
    );
    let state = wire(&config, primary, fallback);
    let app = build_router(state.clone());

    let response = app
        .oneshot(chat(json!({"session_id": "e2e-3", "message": "hello", "tools": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.headers()["x-session-id"], "e2e-3");
    let body = json_body(response).await;
    let error = body["error"].as_str().unwrap();
    assert!(error.contains("Both primary and fallback"), "{error}");
    assert!(error.contains("connection refused"), "{error}");

    let session = state.node.manager().get_state("e2e-3").await;
    assert_eq!(session.cumulative_token_usage.calls, 0);
}

#[tokio::test]
async fn streamed_turn_reports_done_and_records_usage() {
    let config = load_config(CONFIG);
    let primary = ScriptedLlm::new("anthropic", vec![says("streamed reply", 9)]);
    let fallback = ScriptedLlm::new("openai", vec![]);
    let state = wire(&config, primary, fallback);
    let app = build_router(state.clone());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/stream")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"session_id": "e2e-4", "message": "hi"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-session-id"], "e2e-4");

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let sse = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(sse.contains("event: delta"), "{sse}");
    assert!(sse.contains("streamed reply"), "{sse}");
    assert!(sse.contains("event: done"), "{sse}");

    let session = state.node.manager().get_state("e2e-4").await;
    assert_eq!(session.cumulative_token_usage.total_tokens, 9);
}

#[tokio::test]
async fn streamed_tool_sequence_moves_session_to_next_step() {
    let config = load_config(CONFIG);
    let primary = ScriptedLlm::new(
        "anthropic",
        vec![
            calls_tool("c1", "search", 10),
            calls_tool("c2", "summarize", 10),
            says("Streamed summary.", 10),
        ],
    );
    let fallback = ScriptedLlm::new("openai", vec![]);
    let state = wire(&config, primary.clone(), fallback);
    let app = build_router(state.clone());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/stream")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"session_id": "e2e-6", "message": "tell me about rust"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let sse = String::from_utf8(bytes.to_vec()).unwrap();
    assert_eq!(sse.matches("event: tool_call").count(), 2, "{sse}");
    assert_eq!(sse.matches("event: tool_result").count(), 2, "{sse}");
    assert!(sse.contains("Streamed summary."), "{sse}");
    assert!(sse.contains(r#""tool_calls_made":2"#), "{sse}");
    assert!(sse.contains("event: done"), "{sse}");

    let session = state.node.manager().get_state("e2e-6").await;
    assert_eq!(session.active_step.as_deref(), Some("answer"));
    assert_eq!(session.recently_used_tools, vec!["summarize", "search"]);
    assert_eq!(session.cumulative_token_usage.total_tokens, 30);
    assert_eq!(
        primary.offered(),
        vec![
            vec!["search".to_string()],
            vec!["summarize".to_string()],
            Vec::<String>::new(),
        ]
    );
}

#[tokio::test]
async fn node_turns_accumulate_across_a_session() {
    let config = load_config(CONFIG);
    let primary = ScriptedLlm::new("anthropic", vec![says("one", 5), says("two", 7)]);
    let fallback = ScriptedLlm::new("openai", vec![]);
    let state = wire(&config, primary, fallback);

    for text in ["first", "second"] {
        let request = TurnRequest::new(
            "e2e-5",
            vec![Message::user(text)],
            state.llm.clone(),
        )
        .with_tools(vec![])
        .with_steps(state.steps.clone());
        state.node.run_turn(request).await.unwrap();
    }

    let session = state.node.manager().get_state("e2e-5").await;
    assert_eq!(session.cumulative_token_usage.total_tokens, 12);
    assert_eq!(session.cumulative_token_usage.calls, 2);

    state.node.manager().reset_state("e2e-5").await;
    let session = state.node.manager().get_state("e2e-5").await;
    assert_eq!(session.cumulative_token_usage.total_tokens, 0);
}
