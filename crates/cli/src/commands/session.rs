//! `tandem session`: Inspect or reset orchestration state.
//!
//! With the default in-memory storage each CLI invocation starts empty;
//! point `[storage]` at a key/value service to inspect gateway sessions.

use std::path::Path;
use tandem_config::StorageBackend;
use tandem_orchestration::OrchestrationManager;

fn manager(config_path: Option<&Path>) -> Result<OrchestrationManager, String> {
    let config = super::load_config(config_path)?;
    if config.storage.backend == StorageBackend::Memory {
        tracing::warn!("Storage backend is in-memory; sessions held by other processes are not visible");
    }
    Ok(tandem_gateway::build_manager(&config))
}

pub async fn show(config_path: Option<&Path>, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let state = manager(config_path)?.get_state(id).await;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

pub async fn reset(config_path: Option<&Path>, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    manager(config_path)?.reset_state(id).await;
    println!("Session {id} reset");
    Ok(())
}
