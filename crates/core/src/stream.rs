//! Streaming results with in-band error interception.
//!
//! A vendor stream can fail after the HTTP request already succeeded, so an
//! error shows up as an item in the chunk channel rather than as an `Err`
//! from `Provider::stream`. `StreamTextResult` owns a background task that
//! drains the whole provider channel, fans text and events out to the
//! consumer, and publishes its progress through a `watch` cell. A consumer
//! reading only the text stream can still check `has_error()` afterwards.

use crate::classify::{ErrorClass, classify_error, describe_provider_error};
use crate::message::MessageToolCall;
use crate::provider::ChunkReceiver;
use crate::usage::TokenUsage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Structured events emitted while a stream is drained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta { text: String },
    ToolCall { call: MessageToolCall },
    Finish { usage: Option<TokenUsage> },
    Error { message: String, class: ErrorClass },
}

/// An in-band failure observed while draining.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFailure {
    pub message: String,
    pub class: ErrorClass,
}

/// What a finished stream produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub text: String,
    pub tool_calls: Vec<MessageToolCall>,
    pub usage: Option<TokenUsage>,
}

/// Progress of the drain task, observable at any time.
#[derive(Debug, Clone, Default)]
pub struct DrainStatus {
    /// At least one item (content, tool call, end or error) arrived.
    pub started: bool,
    /// Text or tool calls were forwarded before any error.
    pub produced_output: bool,
    pub finished: bool,
    pub error: Option<StreamFailure>,
    pub summary: Option<StreamSummary>,
}

/// Passed to the step-finish callback once a stream completes cleanly.
#[derive(Debug, Clone)]
pub struct StepFinish {
    pub text: String,
    pub tool_calls: Vec<MessageToolCall>,
    pub usage: Option<TokenUsage>,
}

pub type StepFinishCallback = Arc<dyn Fn(&StepFinish) + Send + Sync>;

/// The fully materialized outcome of a stream.
#[derive(Debug, Clone)]
pub struct StreamResponse {
    pub provider: String,
    pub model: String,
    pub text: String,
    pub tool_calls: Vec<MessageToolCall>,
    pub usage: Option<TokenUsage>,
    pub error: Option<StreamFailure>,
}

impl StreamResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Handle to a text stream being drained in the background.
pub struct StreamTextResult {
    provider: String,
    model: String,
    text_rx: Option<mpsc::UnboundedReceiver<String>>,
    events_rx: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    status: watch::Receiver<DrainStatus>,
}

impl StreamTextResult {
    /// Start draining `chunks` on a background task.
    ///
    /// Usage objects are normalized against `provider`. `on_step_finish`
    /// runs only when the stream ends without an in-band error.
    pub fn spawn(
        chunks: ChunkReceiver,
        provider: impl Into<String>,
        model: impl Into<String>,
        on_step_finish: Option<StepFinishCallback>,
    ) -> Self {
        let provider = provider.into();
        let model = model.into();
        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(DrainStatus::default());

        tokio::spawn(drain(
            chunks,
            provider.clone(),
            text_tx,
            events_tx,
            status_tx,
            on_step_finish,
        ));

        Self {
            provider,
            model,
            text_rx: Some(text_rx),
            events_rx: Some(events_rx),
            status: status_rx,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Token-by-token text. Can be taken once.
    pub fn text_stream(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.text_rx.take()
    }

    /// Every structured event, including in-band errors. Can be taken once.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        self.events_rx.take()
    }

    pub fn has_error(&self) -> bool {
        self.status.borrow().error.is_some()
    }

    pub fn error(&self) -> Option<StreamFailure> {
        self.status.borrow().error.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.status.borrow().finished
    }

    /// Resolves once the first item has been seen (or the stream ended).
    pub async fn wait_started(&self) -> DrainStatus {
        self.wait_for(|s| s.started || s.finished).await
    }

    /// Resolves once the provider channel has been fully drained.
    pub async fn wait_finished(&self) -> DrainStatus {
        self.wait_for(|s| s.finished).await
    }

    /// Usage summary, available after the stream finishes.
    pub async fn usage(&self) -> Option<TokenUsage> {
        self.wait_finished()
            .await
            .summary
            .and_then(|summary| summary.usage)
    }

    /// Wait for draining to finish and collect everything it saw.
    pub async fn into_response(self) -> StreamResponse {
        let status = self.wait_finished().await;
        let summary = status.summary.unwrap_or_default();
        StreamResponse {
            provider: self.provider,
            model: self.model,
            text: summary.text,
            tool_calls: summary.tool_calls,
            usage: summary.usage,
            error: status.error,
        }
    }

    async fn wait_for(&self, predicate: impl FnMut(&DrainStatus) -> bool) -> DrainStatus {
        let mut rx = self.status.clone();
        let observed = rx.wait_for(predicate).await.map(|status| status.clone());
        match observed {
            Ok(status) => status,
            // The drain task is gone; report whatever it last published.
            Err(_) => {
                let mut status = rx.borrow().clone();
                status.finished = true;
                status
            }
        }
    }
}

async fn drain(
    mut chunks: ChunkReceiver,
    provider: String,
    text_tx: mpsc::UnboundedSender<String>,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    status_tx: watch::Sender<DrainStatus>,
    on_step_finish: Option<StepFinishCallback>,
) {
    let mut summary = StreamSummary::default();
    let mut failure: Option<StreamFailure> = None;

    while let Some(item) = chunks.recv().await {
        match item {
            Ok(chunk) => {
                let mut produced = false;
                if let Some(content) = chunk.content.filter(|c| !c.is_empty()) {
                    summary.text.push_str(&content);
                    let _ = text_tx.send(content.clone());
                    let _ = events_tx.send(StreamEvent::TextDelta { text: content });
                    produced = true;
                }
                for call in chunk.tool_calls {
                    let _ = events_tx.send(StreamEvent::ToolCall { call: call.clone() });
                    summary.tool_calls.push(call);
                    produced = true;
                }
                if let Some(raw) = chunk.usage {
                    summary.usage = Some(TokenUsage::from_vendor(&raw, provider.as_str()));
                }
                status_tx.send_modify(|s| {
                    s.started = true;
                    s.produced_output |= produced;
                });
                if chunk.done {
                    break;
                }
            }
            Err(e) => {
                let stream_failure = StreamFailure {
                    message: describe_provider_error(&e),
                    class: classify_error(&e),
                };
                warn!(
                    provider = %provider,
                    class = %stream_failure.class,
                    error = %stream_failure.message,
                    "In-band stream error"
                );
                let _ = events_tx.send(StreamEvent::Error {
                    message: stream_failure.message.clone(),
                    class: stream_failure.class,
                });
                failure = Some(stream_failure);
                break;
            }
        }
    }

    if failure.is_none() {
        let _ = events_tx.send(StreamEvent::Finish {
            usage: summary.usage.clone(),
        });
        if let Some(callback) = &on_step_finish {
            callback(&StepFinish {
                text: summary.text.clone(),
                tool_calls: summary.tool_calls.clone(),
                usage: summary.usage.clone(),
            });
        }
    }

    debug!(
        provider = %provider,
        chars = summary.text.len(),
        failed = failure.is_some(),
        "Stream drained"
    );

    status_tx.send_modify(|s| {
        s.started = true;
        s.finished = true;
        s.error = failure;
        s.summary = Some(summary);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::StreamChunk;
    use std::sync::Mutex;

    fn text(s: &str) -> Result<StreamChunk, ProviderError> {
        Ok(StreamChunk {
            content: Some(s.into()),
            ..Default::default()
        })
    }

    fn done(usage: serde_json::Value) -> Result<StreamChunk, ProviderError> {
        Ok(StreamChunk {
            done: true,
            usage: Some(usage),
            ..Default::default()
        })
    }

    async fn feed(items: Vec<Result<StreamChunk, ProviderError>>) -> ChunkReceiver {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.send(item).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn clean_stream_collects_text_and_usage() {
        let rx = feed(vec![
            text("Hel"),
            text("lo"),
            done(serde_json::json!({"input_tokens": 4, "output_tokens": 2})),
        ])
        .await;

        let mut result = StreamTextResult::spawn(rx, "anthropic", "claude", None);
        let mut text_rx = result.text_stream().unwrap();
        let mut streamed = String::new();
        while let Some(delta) = text_rx.recv().await {
            streamed.push_str(&delta);
        }
        assert_eq!(streamed, "Hello");

        let response = result.into_response().await;
        assert!(!response.is_error());
        assert_eq!(response.text, "Hello");
        let usage = response.usage.unwrap();
        assert_eq!(usage.total_tokens, 6);
        assert_eq!(usage.provider, "anthropic");
    }

    #[tokio::test]
    async fn in_band_error_sets_flag_for_text_only_consumer() {
        let rx = feed(vec![
            text("partial "),
            Err(ProviderError::StreamInterrupted(
                r#"{"error":{"message":"Overloaded"}}"#.into(),
            )),
        ])
        .await;

        let mut result = StreamTextResult::spawn(rx, "anthropic", "claude", None);
        let mut text_rx = result.text_stream().unwrap();
        while text_rx.recv().await.is_some() {}

        let status = result.wait_finished().await;
        assert!(status.produced_output);
        assert!(result.has_error());
        let failure = result.error().unwrap();
        assert_eq!(failure.class, ErrorClass::Retryable);
        assert!(failure.message.contains("Overloaded"));
    }

    #[tokio::test]
    async fn error_before_output_is_visible_at_start() {
        let rx = feed(vec![Err(ProviderError::ApiError {
            status_code: 400,
            message: "bad request".into(),
        })])
        .await;

        let result = StreamTextResult::spawn(rx, "openai", "gpt-4o", None);
        let status = result.wait_started().await;
        // the error may land in the same update as `started`
        let status = if status.error.is_none() {
            result.wait_finished().await
        } else {
            status
        };
        assert!(!status.produced_output);
        assert_eq!(status.error.unwrap().class, ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn events_include_error_and_skip_finish() {
        let rx = feed(vec![text("a"), Err(ProviderError::Network("reset".into()))]).await;
        let mut result = StreamTextResult::spawn(rx, "openai", "gpt-4o", None);
        let mut events = result.events().unwrap();
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        assert!(matches!(seen[0], StreamEvent::TextDelta { .. }));
        assert!(matches!(seen[1], StreamEvent::Error { class: ErrorClass::Retryable, .. }));
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn step_finish_callback_runs_once_on_success() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: StepFinishCallback = Arc::new(move |step: &StepFinish| {
            sink.lock().unwrap().push(step.text.clone());
        });

        let rx = feed(vec![text("done"), done(serde_json::json!({"total_tokens": 1}))]).await;
        let result = StreamTextResult::spawn(rx, "openai", "gpt-4o", Some(callback));
        assert_eq!(result.usage().await.unwrap().total_tokens, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["done".to_string()]);
    }

    #[tokio::test]
    async fn dropped_text_receiver_does_not_block_drain() {
        let rx = feed(vec![text("x"), text("y"), done(serde_json::json!({}))]).await;
        let mut result = StreamTextResult::spawn(rx, "p", "m", None);
        drop(result.text_stream());
        drop(result.events());
        let response = result.into_response().await;
        assert_eq!(response.text, "xy");
    }
}
