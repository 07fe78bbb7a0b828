//! `tandem config`: Configuration inspection.

use std::path::Path;
use tandem_config::AppConfig;

const SECRET_KEYS: &[&str] = &["api_key", "token"];

pub fn show(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    println!("{}", redacted_toml(&config)?);
    Ok(())
}

pub fn path(config_path: Option<&Path>) {
    match config_path {
        Some(path) => println!("{}", path.display()),
        None => println!("{}", AppConfig::config_dir().join("config.toml").display()),
    }
}

pub fn print_default() {
    println!("{}", AppConfig::default_toml());
}

/// The config as TOML with every non-empty credential replaced.
pub fn redacted_toml(config: &AppConfig) -> Result<String, Box<dyn std::error::Error>> {
    let mut value = toml::Value::try_from(config)?;
    redact(&mut value);
    Ok(toml::to_string_pretty(&value)?)
}

fn redact(value: &mut toml::Value) {
    match value {
        toml::Value::Table(table) => {
            for (key, entry) in table.iter_mut() {
                match entry {
                    toml::Value::String(s) if SECRET_KEYS.contains(&key.as_str()) => {
                        if !s.is_empty() {
                            *s = "[REDACTED]".into();
                        }
                    }
                    other => redact(other),
                }
            }
        }
        toml::Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_config::LlmConfig;

    #[test]
    fn credentials_are_redacted() {
        let mut config = AppConfig::default();
        config.llm.primary = LlmConfig::Anthropic {
            api_key: "sk-ant-secret".into(),
            model: None,
            base_url: None,
        };
        config.llm.fallback = Some(LlmConfig::OpenAi {
            api_key: "sk-other-secret".into(),
            model: Some("gpt-4o-mini".into()),
            base_url: None,
        });
        config.storage.token = Some("kv-token".into());

        let out = redacted_toml(&config).unwrap();
        assert!(!out.contains("sk-ant-secret"), "{out}");
        assert!(!out.contains("sk-other-secret"), "{out}");
        assert!(!out.contains("kv-token"), "{out}");
        assert_eq!(out.matches("[REDACTED]").count(), 3, "{out}");
        assert!(out.contains("gpt-4o-mini"));
    }

    #[test]
    fn empty_credentials_stay_empty() {
        let out = redacted_toml(&AppConfig::default()).unwrap();
        assert!(!out.contains("[REDACTED]"), "{out}");
        assert!(out.contains("anthropic"));
    }

    #[test]
    fn default_path_points_at_config_toml() {
        let path = AppConfig::config_dir().join("config.toml");
        assert!(path.to_str().unwrap().ends_with("config.toml"));
    }
}
