//! The agent execution node: runs one turn against the primary adapter,
//! falling back to the secondary adapter once on a retryable failure.
//!
//! Per turn:
//!
//! 1. **Resolve** the primary and (distinct) fallback adapters
//! 2. **Select** the fallback directly when the caller asks for it
//! 3. **Filter** tools through the orchestration manager before every model call
//! 4. **Execute** the tool loop, each model call under a timeout
//! 5. **Fall back** exactly once if the primary failed with a retryable error,
//!    repeating the failed model call with the transcript built so far
//! 6. **Reconcile** usage of the attempt that produced the answer

use crate::adapters::{AdapterFactory, ProviderAdapterFactory, ResolvedAdapters};
use crate::turn::{AdapterRole, TurnOutcome, TurnRequest};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::classify::{classify_error, describe_provider_error};
use tandem_core::error::{Error, ProviderError, ToolError};
use tandem_core::llm::{GenerateTextResult, Llm};
use tandem_core::message::{Message, MessageToolCall};
use tandem_core::provider::ToolDefinition;
use tandem_core::stream::StreamFailure;
use tandem_core::tool::{ToolCall, ToolContext, ToolRegistry};
use tandem_core::usage::TokenUsage;
use tandem_orchestration::OrchestrationManager;
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_STEPS: u32 = 5;

pub struct AgentNode {
    pub(crate) manager: Arc<OrchestrationManager>,
    tools: Arc<ToolRegistry>,
    factory: Arc<dyn AdapterFactory>,
    pub(crate) timeout: Duration,
    pub(crate) max_steps: u32,
}

/// What one attempt on one adapter produced.
struct Attempt {
    text: String,
    usage: TokenUsage,
    tool_calls_made: usize,
}

/// The transcript a turn has built so far. A failed attempt hands it on, so
/// the retry repeats the failing model call instead of the whole turn.
struct Progress {
    messages: Vec<Message>,
    tool_calls_made: usize,
    model_calls: u32,
}

impl Progress {
    fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tool_calls_made: 0,
            model_calls: 0,
        }
    }
}

struct AttemptFailure {
    error: ProviderError,
    progress: Progress,
}

impl AgentNode {
    pub fn new(manager: Arc<OrchestrationManager>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            manager,
            tools,
            factory: Arc::new(ProviderAdapterFactory),
            timeout: DEFAULT_TIMEOUT,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Per-call timeout for model calls and tool executions.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Upper bound on successful model calls within one turn.
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn manager(&self) -> &Arc<OrchestrationManager> {
        &self.manager
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Run one non-streaming turn.
    ///
    /// Fails only on adapter misconfiguration or when every available
    /// attempt failed. Session usage is updated once, from the attempt that
    /// produced the answer.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome, Error> {
        let adapters = self.resolve(&request)?;
        let (role, llm) = adapters.selected();

        info!(
            session_id = %request.session_id,
            served_by = %role,
            provider = llm.provider_name(),
            model = llm.model(),
            "Running turn"
        );

        let start = Progress::new(request.messages.clone());
        let (role, llm, attempt) = match self.attempt(&request, &llm, start).await {
            Ok(attempt) => (role, llm, attempt),
            Err(failed) => {
                let failure = failure_of(&failed.error);
                let Some(fallback) = retry_target(&adapters, role, &failure) else {
                    return Err(terminal_failure(&adapters, role, &failure));
                };
                warn!(
                    session_id = %request.session_id,
                    provider = llm.provider_name(),
                    error = %failure.message,
                    tool_calls = failed.progress.tool_calls_made,
                    "Primary attempt failed, retrying the same model call on fallback"
                );
                match self.attempt(&request, &fallback, failed.progress).await {
                    Ok(attempt) => (AdapterRole::Fallback, fallback, attempt),
                    Err(second) => {
                        let second = failure_of(&second.error);
                        warn!(
                            session_id = %request.session_id,
                            provider = fallback.provider_name(),
                            error = %second.message,
                            "Fallback attempt failed"
                        );
                        return Err(Error::TurnFailed {
                            primary: Some(failure.message),
                            fallback: Some(second.message),
                        });
                    }
                }
            }
        };

        let state = self
            .manager
            .record_token_usage(&request.session_id, &attempt.usage)
            .await;

        info!(
            session_id = %request.session_id,
            served_by = %role,
            total_tokens = attempt.usage.total_tokens,
            tool_calls = attempt.tool_calls_made,
            "Turn complete"
        );

        Ok(TurnOutcome {
            text: attempt.text,
            usage: attempt.usage,
            served_by: role,
            provider: llm.provider_name().to_string(),
            model: llm.model().to_string(),
            tool_calls_made: attempt.tool_calls_made,
            state: state.snapshot(),
        })
    }

    pub(crate) fn resolve(&self, request: &TurnRequest) -> Result<ResolvedAdapters, Error> {
        ResolvedAdapters::resolve(self.factory.as_ref(), &request.llm, self.timeout).map_err(|e| {
            warn!(session_id = %request.session_id, error = %e, "Adapter construction failed");
            Error::Configuration(e)
        })
    }

    /// Tool names the caller offers this turn, before step filtering.
    pub(crate) fn offered_tools(&self, request: &TurnRequest) -> Vec<String> {
        request.tools.clone().unwrap_or_else(|| self.tools.names())
    }

    /// Definitions of the tools the active step permits right now.
    pub(crate) async fn allowed_tools(
        &self,
        request: &TurnRequest,
        messages: &[Message],
        offered: &[String],
    ) -> (Vec<String>, Vec<ToolDefinition>) {
        let allowed = self
            .manager
            .get_allowed_tools(&request.steps, messages, &request.session_id, offered)
            .await;
        let definitions = self.tools.definitions_for(&allowed);
        (allowed, definitions)
    }

    /// The tool loop on one adapter, continuing from `progress`.
    ///
    /// Tools already executed stay executed: on failure the transcript is
    /// returned with the error so another adapter can pick up from the model
    /// call that failed.
    async fn attempt(
        &self,
        request: &TurnRequest,
        llm: &Arc<dyn Llm>,
        mut progress: Progress,
    ) -> Result<Attempt, AttemptFailure> {
        let offered = self.offered_tools(request);
        let mut usage = TokenUsage::zero(llm.provider_name());

        loop {
            let (allowed, definitions) = self
                .allowed_tools(request, &progress.messages, &offered)
                .await;

            debug!(
                session_id = %request.session_id,
                step = progress.model_calls + 1,
                tools = definitions.len(),
                "Model call"
            );

            let result = match self
                .generate(llm, progress.messages.clone(), definitions)
                .await
            {
                Ok(result) => result,
                Err(error) => return Err(AttemptFailure { error, progress }),
            };
            progress.model_calls += 1;
            usage = usage.merge(&result.usage);

            if result.tool_calls.is_empty() {
                return Ok(Attempt {
                    text: result.text,
                    usage,
                    tool_calls_made: progress.tool_calls_made,
                });
            }

            if progress.model_calls >= self.max_steps {
                warn!(
                    session_id = %request.session_id,
                    max_steps = self.max_steps,
                    "Max model calls reached with tool calls pending, returning last text"
                );
                return Ok(Attempt {
                    text: result.text,
                    usage,
                    tool_calls_made: progress.tool_calls_made,
                });
            }

            progress.messages.push(Message::assistant_with_tool_calls(
                result.text,
                result.tool_calls.clone(),
            ));
            for call in &result.tool_calls {
                let (output, executed) = self
                    .run_tool(request, llm, &progress.messages, call, &allowed)
                    .await;
                if executed {
                    progress.tool_calls_made += 1;
                }
                progress.messages.push(Message::tool_result(&call.id, output));
            }
        }
    }

    async fn generate(
        &self,
        llm: &Arc<dyn Llm>,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<GenerateTextResult, ProviderError> {
        match tokio::time::timeout(self.timeout, llm.generate_text(messages, tools)).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(llm.as_ref(), self.timeout)),
        }
    }

    /// Execute one requested tool; returns the text handed back to the model
    /// and whether the tool ran successfully. Only successful runs are
    /// recorded against the session, so a failed tool never advances a
    /// sequence.
    pub(crate) async fn run_tool(
        &self,
        request: &TurnRequest,
        llm: &Arc<dyn Llm>,
        messages: &[Message],
        call: &MessageToolCall,
        allowed: &[String],
    ) -> (String, bool) {
        let session_id = request.session_id.as_str();

        if !allowed.iter().any(|t| t == &call.name) {
            let step = self
                .manager
                .get_state(session_id)
                .await
                .active_step
                .unwrap_or_else(|| "-".into());
            let err = ToolError::NotAllowed {
                tool_name: call.name.clone(),
                step,
            };
            warn!(session_id, tool = %call.name, "Model requested a tool outside the allowed set");
            return (format!("Error: {err}"), false);
        }

        let arguments = match parse_arguments(&call.arguments) {
            Ok(arguments) => arguments,
            Err(err) => return (format!("Error: {err}"), false),
        };
        let tool_call = ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments,
        };
        let context = ToolContext {
            tool_call_id: call.id.clone(),
            session_id: session_id.to_string(),
            llm: Some(llm.clone()),
        };

        let result = match tokio::time::timeout(self.timeout, self.tools.execute(&tool_call, &context))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool_name: call.name.clone(),
                timeout_secs: self.timeout.as_secs(),
            }),
        };

        let output = match result {
            Ok(result) if result.success => {
                debug!(session_id, tool = %call.name, "Tool executed");
                result.output
            }
            Ok(result) => {
                warn!(session_id, tool = %call.name, "Tool reported failure, not recorded");
                return (result.output, false);
            }
            Err(ToolError::NotFound(name)) => {
                warn!(session_id, tool = %name, "Model requested an unregistered tool");
                return (format!("Error: {}", ToolError::NotFound(name)), false);
            }
            Err(e) => {
                warn!(session_id, tool = %call.name, error = %e, "Tool failed, not recorded");
                return (format!("Error: {e}"), false);
            }
        };

        self.manager
            .process_tool_usage(&request.steps, messages, session_id, &call.name)
            .await;
        (output, true)
    }
}

fn parse_arguments(raw: &str) -> Result<serde_json::Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

pub(crate) fn timeout_error(llm: &dyn Llm, timeout: Duration) -> ProviderError {
    ProviderError::Timeout(format!(
        "{} ({}) did not respond within {:?}",
        llm.provider_name(),
        llm.model(),
        timeout
    ))
}

pub(crate) fn failure_of(error: &ProviderError) -> StreamFailure {
    StreamFailure {
        message: describe_provider_error(error),
        class: classify_error(error),
    }
}

/// The adapter to retry on, if `failure` on `role` earns a retry.
pub(crate) fn retry_target(
    adapters: &ResolvedAdapters,
    role: AdapterRole,
    failure: &StreamFailure,
) -> Option<Arc<dyn Llm>> {
    if failure.class.is_retryable() {
        adapters.retry_after(role)
    } else {
        None
    }
}

/// The error for a failure that gets no second attempt, saying why.
pub(crate) fn terminal_failure(
    adapters: &ResolvedAdapters,
    role: AdapterRole,
    failure: &StreamFailure,
) -> Error {
    let reason = match role {
        AdapterRole::Fallback => "fallback adapter was selected directly".to_string(),
        AdapterRole::Primary if adapters.fallback.is_none() => "no fallback configured".to_string(),
        AdapterRole::Primary => format!("{} error, not retried", failure.class),
    };
    warn!(error = %failure.message, reason = %reason, "Turn failed");
    let message = format!("{} ({reason})", failure.message);
    match role {
        AdapterRole::Primary => Error::TurnFailed {
            primary: Some(message),
            fallback: None,
        },
        AdapterRole::Fallback => Error::TurnFailed {
            primary: None,
            fallback: Some(message),
        },
    }
}
