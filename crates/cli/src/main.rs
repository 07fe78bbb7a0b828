//! tandem CLI: the main entry point.
//!
//! Commands:
//! - `serve`: Start the HTTP gateway
//! - `chat`: Run a single turn against the configured LLMs
//! - `session`: Inspect or reset a session's orchestration state
//! - `config`: Print the effective (redacted) configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "tandem",
    about = "tandem: session-scoped tool orchestration with primary/fallback LLM turns",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to load instead of ~/.tandem/config.toml
    #[arg(short, long, global = true, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one message and print the reply
    Chat {
        #[arg(short, long)]
        message: String,

        /// Continue an existing session (a new id is generated otherwise)
        #[arg(short, long)]
        session: Option<String>,

        /// Go straight to the fallback LLM
        #[arg(long)]
        use_fallback: bool,
    },

    /// Inspect or reset session state
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Print the effective configuration with secrets redacted
    Config {
        /// Print the config file path instead
        #[arg(long)]
        path: bool,

        /// Print a default config file
        #[arg(long, conflicts_with = "path")]
        default: bool,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Print the full orchestration state
    Show { id: String },
    /// Delete the session's state
    Reset { id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Serve { port } => commands::serve::run(config_path, port).await?,
        Commands::Chat {
            message,
            session,
            use_fallback,
        } => commands::chat::run(config_path, message, session, use_fallback).await?,
        Commands::Session { action } => match action {
            SessionAction::Show { id } => commands::session::show(config_path, &id).await?,
            SessionAction::Reset { id } => commands::session::reset(config_path, &id).await?,
        },
        Commands::Config { path, default } => {
            if path {
                commands::config_cmd::path(config_path)
            } else if default {
                commands::config_cmd::print_default()
            } else {
                commands::config_cmd::show(config_path)?
            }
        }
    }

    Ok(())
}
