//! Per-session orchestration record.
//!
//! One `OrchestrationState` per session id, persisted as JSON with a TTL.
//! Field names are camelCase on the wire; clients read a subset of them from
//! the `x-orchestration-state` response header.

use crate::usage::{TokenTotals, TokenUsage};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationState {
    pub session_id: String,

    #[serde(default)]
    pub active_step: Option<String>,

    /// Position within the active step's tool sequence.
    #[serde(default)]
    pub sequence_index: usize,

    /// Most recent first, bounded.
    #[serde(default)]
    pub recently_used_tools: Vec<String>,

    #[serde(default)]
    pub cumulative_token_usage: TokenTotals,

    /// Milliseconds since the Unix epoch; never moves backwards.
    #[serde(default)]
    pub last_update_time: i64,
}

impl OrchestrationState {
    /// The state of a session nobody has written yet.
    pub fn fresh(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            active_step: None,
            sequence_index: 0,
            recently_used_tools: Vec::new(),
            cumulative_token_usage: TokenTotals::default(),
            last_update_time: 0,
        }
    }

    /// Advance `last_update_time` to now, or keep it if the clock went backwards.
    pub fn touch(&mut self) {
        self.last_update_time = self.last_update_time.max(Utc::now().timestamp_millis());
    }

    /// Record a tool at the front of the recent list, evicting the oldest past `cap`.
    pub fn push_recent_tool(&mut self, tool: &str, cap: usize) {
        self.recently_used_tools.insert(0, tool.to_string());
        self.recently_used_tools.truncate(cap);
    }

    pub fn add_usage(&mut self, usage: &TokenUsage) {
        self.cumulative_token_usage.add(usage);
    }

    pub fn snapshot(&self) -> OrchestrationSnapshot {
        OrchestrationSnapshot {
            session_id: self.session_id.clone(),
            recently_used_tools: self.recently_used_tools.clone(),
            active_step: self.active_step.clone(),
            sequence_index: self.sequence_index,
        }
    }
}

/// The client-visible subset of `OrchestrationState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationSnapshot {
    pub session_id: String,
    pub recently_used_tools: Vec<String>,
    pub active_step: Option<String>,
    pub sequence_index: usize,
}

impl OrchestrationSnapshot {
    /// JSON suitable for a response header value.
    pub fn header_value(&self) -> String {
        // Plain strings and integers only; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}
