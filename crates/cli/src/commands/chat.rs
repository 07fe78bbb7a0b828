//! `tandem chat`: Run a single turn and print the reply.

use std::path::Path;
use tandem_agent::TurnRequest;
use tandem_core::message::Message;
use tandem_core::tool::ToolRegistry;

pub async fn run(
    config_path: Option<&Path>,
    message: String,
    session: Option<String>,
    use_fallback: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let state = tandem_gateway::build_state(&config, ToolRegistry::new());

    let session_id = session
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let request = TurnRequest::new(
        session_id.clone(),
        vec![Message::user(message)],
        state.llm.clone().prefer_fallback(use_fallback),
    )
    .with_steps(state.steps.clone());

    let outcome = state
        .node
        .run_turn(request)
        .await
        .map_err(|e| format!("Turn failed: {e}"))?;

    println!("{}", outcome.text);
    eprintln!();
    eprintln!(
        "[session {session_id} | {} {} ({}) | tokens {} in / {} out]",
        outcome.served_by,
        outcome.provider,
        outcome.model,
        outcome.usage.prompt_tokens,
        outcome.usage.completion_tokens
    );

    Ok(())
}
