pub mod chat;
pub mod config_cmd;
pub mod serve;
pub mod session;

use std::path::Path;
use tandem_config::AppConfig;

/// Load the config from `path` when given, else from the default location.
/// Environment overrides apply either way.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, String> {
    let loaded = match path {
        Some(path) => AppConfig::load_with_env(path),
        None => AppConfig::load(),
    };
    loaded.map_err(|e| format!("Failed to load config: {e}"))
}
