//! HTTP gateway for tandem.
//!
//! Exposes the agent execution node over HTTP: a JSON chat endpoint, an SSE
//! streaming variant, and session inspection/reset. Every chat and session
//! response carries `x-session-id` and `x-orchestration-state`.
//!
//! Built on Axum. The orchestration manager and agent node are constructed
//! once in [`build_state`] and shared by every request.

pub mod api_v1;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, Method, header};
use axum::{Router, response::Json, routing::get};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tandem_agent::{AgentNode, TurnLlmConfig};
use tandem_config::AppConfig;
use tandem_core::step::StepConfig;
use tandem_core::tool::ToolRegistry;
use tandem_orchestration::{
    ORCHESTRATION_STATE_HEADER, OrchestrationManager, SESSION_ID_HEADER, SessionStore,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub node: Arc<AgentNode>,
    /// LLM selection applied to every turn.
    pub llm: TurnLlmConfig,
    pub steps: StepConfig,
}

pub type SharedState = Arc<GatewayState>;

/// Wire the storage and session store described by `config` into a manager.
pub fn build_manager(config: &AppConfig) -> OrchestrationManager {
    let storage = tandem_storage::build_from_config(&config.storage);
    let store = SessionStore::new(storage, Duration::from_secs(config.storage.ttl_secs))
        .with_key_prefix(config.storage.key_prefix.clone());
    OrchestrationManager::new(store).with_recent_tools_cap(config.orchestration.recent_tools_cap)
}

/// Build the manager and agent node described by `config`.
pub fn build_state(config: &AppConfig, tools: ToolRegistry) -> SharedState {
    let manager = Arc::new(build_manager(config));
    let node = AgentNode::new(manager, Arc::new(tools))
        .with_timeout(Duration::from_secs(config.llm.timeout_secs))
        .with_max_steps(config.llm.max_steps);

    Arc::new(GatewayState {
        node: Arc::new(node),
        llm: TurnLlmConfig::from(&config.llm),
        steps: config.orchestration.step_config(),
    })
}

/// Build the full router: health plus the v1 API.
///
/// Layers applied:
/// - Request body size limit (1 MB)
/// - CORS exposing the session headers to browser clients
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([
            HeaderName::from_static(SESSION_ID_HEADER),
            HeaderName::from_static(ORCHESTRATION_STATE_HEADER),
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
///
/// The configured adapters are validated up front so a bad credential
/// stops the server instead of failing every request.
pub async fn start(config: AppConfig, tools: ToolRegistry) -> Result<(), Box<dyn std::error::Error>> {
    tandem_providers::validate(&config.llm.primary)?;
    if let Some(fallback) = &config.llm.fallback {
        tandem_providers::validate(fallback)?;
    }

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let state = build_state(&config, tools);
    let app = build_router(state);

    info!(
        addr = %addr,
        primary = config.llm.primary.provider_name(),
        fallback = config.llm.fallback.as_ref().map(|f| f.provider_name()).unwrap_or("-"),
        storage = %config.storage.backend,
        "Gateway starting"
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint() {
        let app = build_router(build_state(&AppConfig::default(), ToolRegistry::new()));

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn state_follows_config() {
        let mut config = AppConfig::default();
        config.orchestration.steps = vec![tandem_core::step::Step::named("gather").default_step()];
        let state = build_state(&config, ToolRegistry::new());
        assert_eq!(state.steps.steps.len(), 1);
        assert_eq!(state.llm.primary.provider_name(), "anthropic");
        assert!(state.llm.fallback.is_none());
        assert_eq!(state.node.manager().store().ttl(), Duration::from_secs(1800));
    }
}
