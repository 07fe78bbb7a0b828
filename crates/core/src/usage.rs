//! Token usage accounting.
//!
//! `TokenUsage` is one normalized observation from one LLM call.
//! `TokenTotals` is the per-session running sum and only ever grows.

use serde::{Deserialize, Serialize};

/// Normalized token counts reported by a single LLM call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Which provider reported the usage (e.g. "anthropic").
    pub provider: String,
}

const PROMPT_KEYS: &[&str] = &[
    "prompt_tokens",
    "promptTokens",
    "input_tokens",
    "inputTokens",
    "promptTokenCount",
];
const COMPLETION_KEYS: &[&str] = &[
    "completion_tokens",
    "completionTokens",
    "output_tokens",
    "outputTokens",
    "candidatesTokenCount",
];
const TOTAL_KEYS: &[&str] = &["total_tokens", "totalTokens", "totalTokenCount"];

fn first_count(usage: &serde_json::Value, keys: &[&str]) -> Option<u32> {
    keys.iter()
        .find_map(|k| usage.get(*k).and_then(serde_json::Value::as_u64))
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
}

impl TokenUsage {
    /// Normalize a vendor usage object into the canonical shape.
    ///
    /// Understands OpenAI (`prompt_tokens`), AI-SDK style (`promptTokens`),
    /// Anthropic (`input_tokens`) and Gemini (`promptTokenCount`) field names.
    /// A missing total is derived from prompt + completion.
    pub fn from_vendor(usage: &serde_json::Value, provider: impl Into<String>) -> Self {
        let prompt_tokens = first_count(usage, PROMPT_KEYS).unwrap_or(0);
        let completion_tokens = first_count(usage, COMPLETION_KEYS).unwrap_or(0);
        let total_tokens = first_count(usage, TOTAL_KEYS)
            .unwrap_or_else(|| prompt_tokens.saturating_add(completion_tokens));

        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            provider: provider.into(),
        }
    }

    /// An empty observation for `provider`.
    pub fn zero(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Self::default()
        }
    }

    /// Sum two observations made within the same attempt.
    pub fn merge(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.saturating_add(other.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(other.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(other.total_tokens),
            provider: if self.provider.is_empty() {
                other.provider.clone()
            } else {
                self.provider.clone()
            },
        }
    }
}

/// Cumulative usage across every LLM call in a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub calls: u64,
}

impl TokenTotals {
    /// Fold one observation in. Saturating, so totals never decrease.
    pub fn add(&mut self, usage: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(u64::from(usage.prompt_tokens));
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(u64::from(usage.completion_tokens));
        self.total_tokens = self.total_tokens.saturating_add(u64::from(usage.total_tokens));
        self.calls = self.calls.saturating_add(1);
    }
}
