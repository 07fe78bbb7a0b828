//! `tandem serve`: Start the HTTP gateway.

use std::path::Path;
use tandem_core::tool::ToolRegistry;

pub async fn run(
    config_path: Option<&Path>,
    port_override: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = super::load_config(config_path)?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("tandem gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!(
        "   Primary:   {} ({})",
        config.llm.primary.provider_name(),
        config.llm.primary.resolved_model()
    );
    match &config.llm.fallback {
        Some(fallback) => println!(
            "   Fallback:  {} ({})",
            fallback.provider_name(),
            fallback.resolved_model()
        ),
        None => println!("   Fallback:  none"),
    }
    println!("   Storage:   {}", config.storage.backend);

    tandem_gateway::start(config, ToolRegistry::new()).await?;

    Ok(())
}
