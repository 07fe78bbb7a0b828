//! Streaming turns.
//!
//! A stream is committed once it produces output: only a failure to start,
//! or an in-band error before the first text or tool call, can still move
//! the turn to the fallback adapter. Later errors are reported on the
//! finished turn instead, and its usage is not recorded.
//!
//! Tool calls run the same bounded loop as a non-streaming turn. A
//! background task executes each batch of calls, records them against the
//! session, and opens the next stream on the same adapter with the step's
//! tools filtered again. Text from every stream flows into one channel.

use crate::node::{AgentNode, failure_of, retry_target, terminal_failure, timeout_error};
use crate::turn::{AdapterRole, StreamedTurn, TurnEvent, TurnRequest};
use std::sync::Arc;
use tandem_core::classify::ErrorClass;
use tandem_core::error::{Error, ProviderError};
use tandem_core::llm::Llm;
use tandem_core::message::Message;
use tandem_core::provider::ToolDefinition;
use tandem_core::stream::{StreamEvent, StreamFailure, StreamResponse, StreamTextResult};
use tandem_core::usage::TokenUsage;
use tandem_orchestration::OrchestrationManager;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A turn whose response is being streamed.
pub struct TurnStream {
    served_by: AdapterRole,
    provider: String,
    model: String,
    session_id: String,
    manager: Arc<OrchestrationManager>,
    text_rx: Option<mpsc::UnboundedReceiver<String>>,
    events_rx: Option<mpsc::UnboundedReceiver<TurnEvent>>,
    task: JoinHandle<StreamedTurn>,
}

impl TurnStream {
    pub fn served_by(&self) -> AdapterRole {
        self.served_by
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Text deltas of every model call in the turn. Can be taken once.
    pub fn text_stream(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.text_rx.take()
    }

    /// Text, tool calls and tool results as they happen. Can be taken once.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<TurnEvent>> {
        self.events_rx.take()
    }

    /// Wait for the turn to end. Usage is recorded by then unless it failed.
    pub async fn finish(self) -> StreamedTurn {
        match self.task.await {
            Ok(turn) => turn,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Stream task ended abnormally");
                let state = self.manager.get_state(&self.session_id).await;
                StreamedTurn {
                    response: StreamResponse {
                        provider: self.provider,
                        model: self.model,
                        text: String::new(),
                        tool_calls: Vec::new(),
                        usage: None,
                        error: Some(StreamFailure {
                            message: format!("stream task failed: {e}"),
                            class: ErrorClass::Permanent,
                        }),
                    },
                    served_by: self.served_by,
                    tool_calls_made: 0,
                    state: state.snapshot(),
                }
            }
        }
    }
}

/// Everything the background task needs to keep a streamed turn going.
struct StreamLoop {
    node: Arc<AgentNode>,
    request: TurnRequest,
    llm: Arc<dyn Llm>,
    served_by: AdapterRole,
    offered: Vec<String>,
    allowed: Vec<String>,
    text_tx: mpsc::UnboundedSender<String>,
    events_tx: mpsc::UnboundedSender<TurnEvent>,
}

impl StreamLoop {
    async fn run(mut self, first: StreamTextResult) -> StreamedTurn {
        let session_id = self.request.session_id.clone();
        let mut messages = self.request.messages.clone();
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = TokenUsage::zero(self.llm.provider_name());
        let mut tool_calls_made = 0;
        let mut model_calls = 0;
        let mut current = first;

        let failure = loop {
            model_calls += 1;
            self.forward(&mut current).await;

            let response = current.into_response().await;
            text.push_str(&response.text);
            tool_calls.extend(response.tool_calls.iter().cloned());
            if let Some(failure) = response.error {
                break Some(failure);
            }
            if let Some(call_usage) = &response.usage {
                usage = usage.merge(call_usage);
            }
            if response.tool_calls.is_empty() {
                break None;
            }
            if model_calls >= self.node.max_steps {
                warn!(
                    session_id = %session_id,
                    max_steps = self.node.max_steps,
                    "Max model calls reached with tool calls pending, ending stream"
                );
                break None;
            }

            messages.push(Message::assistant_with_tool_calls(
                response.text,
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                let (output, executed) = self
                    .node
                    .run_tool(&self.request, &self.llm, &messages, call, &self.allowed)
                    .await;
                if executed {
                    tool_calls_made += 1;
                }
                let _ = self.events_tx.send(TurnEvent::ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    output: output.clone(),
                    executed,
                });
                messages.push(Message::tool_result(&call.id, output));
            }

            let (allowed, definitions) = self
                .node
                .allowed_tools(&self.request, &messages, &self.offered)
                .await;
            self.allowed = allowed;
            debug!(session_id = %session_id, step = model_calls + 1, tools = definitions.len(), "Model call");
            match self.node.open_stream(&self.llm, &messages, definitions).await {
                Ok(next) => current = next,
                Err(failure) => break Some(failure),
            }
        };

        let manager = self.node.manager();
        let state = match &failure {
            Some(failure) => {
                warn!(
                    session_id = %session_id,
                    served_by = %self.served_by,
                    error = %failure.message,
                    "Stream failed after output began, usage not recorded"
                );
                manager.get_state(&session_id).await
            }
            None => {
                info!(
                    session_id = %session_id,
                    served_by = %self.served_by,
                    total_tokens = usage.total_tokens,
                    tool_calls = tool_calls_made,
                    "Streamed turn complete"
                );
                manager.record_token_usage(&session_id, &usage).await
            }
        };

        StreamedTurn {
            response: StreamResponse {
                provider: self.llm.provider_name().to_string(),
                model: self.llm.model().to_string(),
                text,
                tool_calls,
                usage: Some(usage),
                error: failure,
            },
            served_by: self.served_by,
            tool_calls_made,
            state: state.snapshot(),
        }
    }

    /// Relay one model call's output until its stream is drained.
    async fn forward(&self, stream: &mut StreamTextResult) {
        let Some(mut events) = stream.events() else {
            return;
        };
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::TextDelta { text } => {
                    let _ = self.text_tx.send(text.clone());
                    let _ = self.events_tx.send(TurnEvent::TextDelta { text });
                }
                StreamEvent::ToolCall { call } => {
                    let _ = self.events_tx.send(TurnEvent::ToolCall { call });
                }
                StreamEvent::Finish { .. } | StreamEvent::Error { .. } => {}
            }
        }
    }
}

impl AgentNode {
    /// Start a streaming turn.
    ///
    /// Returns once the selected adapter has produced its first item, so a
    /// stream that fails immediately can still be retried on the fallback.
    /// The rest of the turn, tool calls included, runs in the background.
    pub async fn stream_turn(self: &Arc<Self>, request: TurnRequest) -> Result<TurnStream, Error> {
        let adapters = self.resolve(&request)?;
        let (role, llm) = adapters.selected();

        let offered = self.offered_tools(&request);
        let (allowed, definitions) = self
            .allowed_tools(&request, &request.messages, &offered)
            .await;

        info!(
            session_id = %request.session_id,
            served_by = %role,
            provider = llm.provider_name(),
            "Streaming turn"
        );

        let (role, llm, result) = match self
            .open_stream(&llm, &request.messages, definitions.clone())
            .await
        {
            Ok(result) => (role, llm, result),
            Err(failure) => {
                let Some(fallback) = retry_target(&adapters, role, &failure) else {
                    return Err(terminal_failure(&adapters, role, &failure));
                };
                warn!(
                    session_id = %request.session_id,
                    provider = llm.provider_name(),
                    error = %failure.message,
                    "Primary stream failed before output, retrying on fallback"
                );
                match self.open_stream(&fallback, &request.messages, definitions).await {
                    Ok(result) => (AdapterRole::Fallback, fallback, result),
                    Err(second) => {
                        warn!(
                            session_id = %request.session_id,
                            provider = fallback.provider_name(),
                            error = %second.message,
                            "Fallback stream failed"
                        );
                        return Err(Error::TurnFailed {
                            primary: Some(failure.message),
                            fallback: Some(second.message),
                        });
                    }
                }
            }
        };

        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let provider = llm.provider_name().to_string();
        let model = llm.model().to_string();
        let session_id = request.session_id.clone();

        let driver = StreamLoop {
            node: self.clone(),
            request,
            llm,
            served_by: role,
            offered,
            allowed,
            text_tx,
            events_tx,
        };
        let task = tokio::spawn(driver.run(result));

        Ok(TurnStream {
            served_by: role,
            provider,
            model,
            session_id,
            manager: self.manager.clone(),
            text_rx: Some(text_rx),
            events_rx: Some(events_rx),
            task,
        })
    }

    /// Start a stream and wait for its first item. An error that arrives
    /// before any output counts as a failure to start.
    async fn open_stream(
        &self,
        llm: &Arc<dyn Llm>,
        messages: &[Message],
        tools: Vec<ToolDefinition>,
    ) -> Result<StreamTextResult, StreamFailure> {
        let started = tokio::time::timeout(self.timeout, async {
            let result = llm.stream_text(messages.to_vec(), tools, None).await?;
            let status = result.wait_started().await;
            Ok::<_, ProviderError>((result, status))
        })
        .await;

        match started {
            Err(_) => Err(failure_of(&timeout_error(llm.as_ref(), self.timeout))),
            Ok(Err(e)) => Err(failure_of(&e)),
            Ok(Ok((result, status))) => match status.error {
                Some(failure) if !status.produced_output => Err(failure),
                _ => Ok(result),
            },
        }
    }
}
