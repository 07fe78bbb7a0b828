//! Turn request and outcome types.

use serde::{Deserialize, Serialize};
use tandem_config::{LlmConfig, LlmSettings};
use tandem_core::message::{Message, MessageToolCall};
use tandem_core::session::OrchestrationSnapshot;
use tandem_core::step::StepConfig;
use tandem_core::stream::StreamResponse;
use tandem_core::usage::TokenUsage;

/// LLM selection for one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnLlmConfig {
    pub primary: LlmConfig,
    pub fallback: Option<LlmConfig>,
    /// Go straight to the fallback adapter when one exists.
    pub use_fallback: bool,
}

impl TurnLlmConfig {
    pub fn new(primary: LlmConfig) -> Self {
        Self {
            primary,
            fallback: None,
            use_fallback: false,
        }
    }

    pub fn with_fallback(mut self, fallback: LlmConfig) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn prefer_fallback(mut self, use_fallback: bool) -> Self {
        self.use_fallback = use_fallback;
        self
    }
}

impl From<&LlmSettings> for TurnLlmConfig {
    fn from(settings: &LlmSettings) -> Self {
        Self {
            primary: settings.primary.clone(),
            fallback: settings.fallback.clone(),
            use_fallback: false,
        }
    }
}

/// Everything a single turn needs.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub messages: Vec<Message>,
    /// Tool names offered this turn; `None` means every registered tool.
    pub tools: Option<Vec<String>>,
    pub llm: TurnLlmConfig,
    pub steps: StepConfig,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, messages: Vec<Message>, llm: TurnLlmConfig) -> Self {
        Self {
            session_id: session_id.into(),
            messages,
            tools: None,
            llm,
            steps: StepConfig::default(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_steps(mut self, steps: StepConfig) -> Self {
        self.steps = steps;
        self
    }
}

/// Which adapter produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterRole {
    Primary,
    Fallback,
}

impl std::fmt::Display for AdapterRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Result of a completed non-streaming turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub text: String,
    /// Usage summed over every model call of the serving attempt.
    pub usage: TokenUsage,
    pub served_by: AdapterRole,
    pub provider: String,
    pub model: String,
    pub tool_calls_made: usize,
    pub state: OrchestrationSnapshot,
}

/// Something that happened during a streamed turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    TextDelta {
        text: String,
    },
    ToolCall {
        call: MessageToolCall,
    },
    /// `executed` is false when the tool was refused, missing or failed.
    ToolResult {
        call_id: String,
        name: String,
        output: String,
        executed: bool,
    },
}

/// Result of a streamed turn once the stream has ended.
///
/// `response` spans every model call of the turn: text is concatenated and
/// usage summed.
#[derive(Debug, Clone)]
pub struct StreamedTurn {
    pub response: StreamResponse,
    pub served_by: AdapterRole,
    pub tool_calls_made: usize,
    pub state: OrchestrationSnapshot,
}

impl StreamedTurn {
    pub fn is_error(&self) -> bool {
        self.response.is_error()
    }
}
