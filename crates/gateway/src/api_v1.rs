//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST   /v1/chat`: Run one turn, get a JSON response
//! - `POST   /v1/chat/stream`: Run one turn, get an SSE stream of text and tool events
//! - `GET    /v1/sessions/{id}`: Current orchestration state of a session
//! - `DELETE /v1/sessions/{id}`: Reset a session

use crate::{GatewayState, SharedState};
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use tandem_agent::{AdapterRole, TurnEvent, TurnRequest};
use tandem_core::error::Error;
use tandem_core::message::Message;
use tandem_core::session::OrchestrationSnapshot;
use tandem_core::usage::TokenUsage;
use tandem_orchestration::{ORCHESTRATION_STATE_HEADER, SESSION_ID_HEADER};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/chat/stream", post(chat_stream_handler))
        .route(
            "/sessions/{id}",
            get(get_session_handler).delete(delete_session_handler),
        )
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatRequest {
    /// Existing session id (omit to start a new session).
    #[serde(default)]
    session_id: Option<String>,

    #[serde(default)]
    messages: Vec<Message>,

    /// Shorthand for appending a single user message.
    #[serde(default)]
    message: Option<String>,

    /// Tool names offered this turn (omit for every registered tool).
    #[serde(default)]
    tools: Option<Vec<String>>,

    #[serde(default)]
    use_fallback: bool,
}

impl ChatRequest {
    fn into_turn(self, state: &GatewayState) -> Result<TurnRequest, ApiError> {
        let session_id = self
            .session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut messages = self.messages;
        if let Some(message) = self.message {
            messages.push(Message::user(message));
        }
        if messages.is_empty() {
            return Err(ApiError::bad_request(session_id, "messages must not be empty"));
        }

        let llm = state.llm.clone().prefer_fallback(self.use_fallback);
        let mut turn = TurnRequest::new(session_id, messages, llm).with_steps(state.steps.clone());
        turn.tools = self.tools;
        Ok(turn)
    }
}

#[derive(Serialize)]
struct ChatResponse {
    session_id: String,
    text: String,
    served_by: AdapterRole,
    provider: String,
    model: String,
    usage: TokenUsage,
    tool_calls_made: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// An error response that still echoes the session id.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    session_id: String,
}

impl ApiError {
    fn bad_request(session_id: String, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            session_id,
        }
    }

    /// Terminal turn failures are upstream failures (502); anything else,
    /// misconfiguration included, is ours (500).
    fn from_turn(session_id: String, err: Error) -> Self {
        let status = match &err {
            Error::TurnFailed { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
            session_id,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, SESSION_ID_HEADER, &self.session_id);
        (
            self.status,
            headers,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => warn!(header = name, "Header value is not valid ASCII, omitted"),
    }
}

/// `x-session-id` and `x-orchestration-state` for a snapshot.
fn session_headers(snapshot: &OrchestrationSnapshot) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, SESSION_ID_HEADER, &snapshot.session_id);
    insert_header(&mut headers, ORCHESTRATION_STATE_HEADER, &snapshot.header_value());
    headers
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn chat_handler(
    State(state): State<SharedState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let turn = payload.into_turn(&state)?;
    let session_id = turn.session_id.clone();
    info!(session_id = %session_id, messages = turn.messages.len(), "v1/chat request");

    let outcome = state
        .node
        .run_turn(turn)
        .await
        .map_err(|e| ApiError::from_turn(session_id, e))?;

    let headers = session_headers(&outcome.state);
    let body = ChatResponse {
        session_id: outcome.state.session_id.clone(),
        text: outcome.text,
        served_by: outcome.served_by,
        provider: outcome.provider,
        model: outcome.model,
        usage: outcome.usage,
        tool_calls_made: outcome.tool_calls_made,
    };
    Ok((headers, Json(body)).into_response())
}

/// `POST /v1/chat/stream`: `delta` events carrying `{"text": …}`,
/// `tool_call` and `tool_result` events as the tool loop runs, then one
/// terminal `done` or `error` event.
async fn chat_stream_handler(
    State(state): State<SharedState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let turn = payload.into_turn(&state)?;
    let session_id = turn.session_id.clone();
    info!(session_id = %session_id, messages = turn.messages.len(), "v1/chat/stream request");

    let mut stream = state
        .node
        .stream_turn(turn)
        .await
        .map_err(|e| ApiError::from_turn(session_id.clone(), e))?;
    let headers = session_headers(&state.node.manager().snapshot(&session_id).await);

    let (tx, rx) = mpsc::channel::<SseEvent>(64);
    let events_rx = stream.events();
    tokio::spawn(async move {
        let mut client_gone = false;
        if let Some(mut events_rx) = events_rx {
            while let Some(turn_event) = events_rx.recv().await {
                if client_gone {
                    continue;
                }
                if tx.send(sse_event(&turn_event)).await.is_err() {
                    client_gone = true;
                }
            }
        }

        // Drain to the end even without a listener so usage is reconciled.
        let turn = stream.finish().await;
        let event = match &turn.response.error {
            None => SseEvent::default().event("done").data(
                json!({
                    "session_id": turn.state.session_id,
                    "served_by": turn.served_by,
                    "provider": turn.response.provider,
                    "model": turn.response.model,
                    "usage": turn.response.usage,
                    "tool_calls_made": turn.tool_calls_made,
                    "state": turn.state,
                })
                .to_string(),
            ),
            Some(failure) => SseEvent::default().event("error").data(
                json!({
                    "error": failure.message,
                    "class": failure.class,
                })
                .to_string(),
            ),
        };
        let _ = tx.send(event).await;
    });

    let events = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Ok((headers, Sse::new(events).keep_alive(KeepAlive::default())).into_response())
}

fn sse_event(event: &TurnEvent) -> SseEvent {
    match event {
        TurnEvent::TextDelta { text } => SseEvent::default()
            .event("delta")
            .data(json!({ "text": text }).to_string()),
        TurnEvent::ToolCall { call } => SseEvent::default()
            .event("tool_call")
            .data(json!({ "id": call.id, "name": call.name, "arguments": call.arguments }).to_string()),
        TurnEvent::ToolResult {
            call_id,
            name,
            output,
            executed,
        } => SseEvent::default().event("tool_result").data(
            json!({
                "call_id": call_id,
                "name": name,
                "output": output,
                "executed": executed,
            })
            .to_string(),
        ),
    }
}

async fn get_session_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Response {
    let session = state.node.manager().get_state(&id).await;
    (session_headers(&session.snapshot()), Json(session)).into_response()
}

async fn delete_session_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Response {
    state.node.manager().reset_state(&id).await;
    let fresh = tandem_core::session::OrchestrationState::fresh(id);
    (StatusCode::NO_CONTENT, session_headers(&fresh.snapshot())).into_response()
}
