//! Step configuration: the caller-supplied description of a multi-step workflow.
//!
//! Immutable and never persisted. The orchestration crate evaluates it
//! against conversation history and session state.

use serde::{Deserialize, Serialize};

/// Ordered list of steps. Declaration order is evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl StepConfig {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,

    #[serde(default, alias = "isDefault")]
    pub is_default: bool,

    /// All must hold for the step to activate. Empty means always.
    #[serde(default)]
    pub conditions: Vec<StepCondition>,

    /// Tools that must be called in this order while the step is active.
    #[serde(default)]
    pub sequence: Vec<String>,

    /// Start the sequence over once it completes.
    #[serde(default, alias = "repeatSequence")]
    pub repeat_sequence: bool,

    #[serde(default, alias = "availableTools", skip_serializing_if = "Option::is_none")]
    pub available_tools: Option<AvailableTools>,
}

impl Step {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn default_step(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_sequence<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sequence = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_available_tools(mut self, available: AvailableTools) -> Self {
        self.available_tools = Some(available);
        self
    }
}

/// Allow/deny pair restricting which tools the LLM may see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvailableTools {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied: Option<Vec<String>>,
}

impl AvailableTools {
    pub fn allow<I: IntoIterator<Item = S>, S: Into<String>>(tools: I) -> Self {
        Self {
            allowed: Some(tools.into_iter().map(Into::into).collect()),
            denied: None,
        }
    }

    pub fn deny<I: IntoIterator<Item = S>, S: Into<String>>(tools: I) -> Self {
        Self {
            allowed: None,
            denied: Some(tools.into_iter().map(Into::into).collect()),
        }
    }
}

/// A predicate over conversation history and session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepCondition {
    /// The tool appears in the session's recently used tools.
    ToolUsed { tool: String },
    ToolNotUsed { tool: String },
    /// The most recently used tool is exactly this one.
    LastToolWas { tool: String },
    MinMessages { count: usize },
    MaxMessages { count: usize },
    /// The latest user message contains the text (case-insensitive).
    MessageContains { text: String },
    /// The session's sequence index has reached at least this position.
    MinSequenceIndex { index: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toml_steps() {
        let config: StepConfig = toml::from_str(
            r#"
[[steps]]
name = "research"
conditions = [{ type = "message_contains", text = "find" }]
available_tools = { denied = ["image_generation"] }

[[steps]]
name = "gather"
is_default = true
sequence = ["search", "summarize"]
"#,
        )
        .unwrap();

        assert_eq!(config.steps.len(), 2);
        assert_eq!(
            config.steps[0].conditions[0],
            StepCondition::MessageContains {
                text: "find".into()
            }
        );
        assert!(config.steps[1].is_default);
        assert_eq!(config.get("gather").unwrap().sequence, vec!["search", "summarize"]);
    }

    #[test]
    fn parses_camel_case_json() {
        let config: StepConfig = serde_json::from_str(
            r#"{"steps":[{"name":"gather","isDefault":true,"sequence":["a"],"availableTools":{"allowed":["a","b"]}}]}"#,
        )
        .unwrap();
        let step = &config.steps[0];
        assert!(step.is_default);
        assert_eq!(
            step.available_tools,
            Some(AvailableTools::allow(["a", "b"]))
        );
    }
}
