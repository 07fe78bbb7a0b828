//! Orchestration state manager: the step state machine bound to a
//! session store.
//!
//! Constructed once per process and shared. Orchestration is best-effort
//! accounting: every storage failure is logged and the operation proceeds
//! as if the session were fresh, so nothing here fails a request.

use crate::session::SessionStore;
use crate::steps;
use tandem_core::message::Message;
use tandem_core::session::{OrchestrationSnapshot, OrchestrationState};
use tandem_core::step::{Step, StepConfig};
use tandem_core::usage::TokenUsage;
use tracing::{debug, info, warn};

pub const DEFAULT_RECENT_TOOLS_CAP: usize = 10;

pub struct OrchestrationManager {
    store: SessionStore,
    recent_tools_cap: usize,
}

impl OrchestrationManager {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            recent_tools_cap: DEFAULT_RECENT_TOOLS_CAP,
        }
    }

    pub fn with_recent_tools_cap(mut self, cap: usize) -> Self {
        self.recent_tools_cap = cap.max(1);
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Current state, or a fresh one when absent or unreadable.
    pub async fn get_state(&self, session_id: &str) -> OrchestrationState {
        match self.store.get_state(session_id).await {
            Ok(Some(state)) => state,
            Ok(None) => OrchestrationState::fresh(session_id),
            Err(e) => {
                warn!(session_id, error = %e, "Orchestration storage read failed, treating session as fresh");
                OrchestrationState::fresh(session_id)
            }
        }
    }

    /// Resolve the active step, persisting it when it changed.
    pub async fn get_active_step(
        &self,
        config: &StepConfig,
        messages: &[Message],
        session_id: &str,
    ) -> Option<String> {
        let (step, _) = self.resolve(config, messages, session_id).await;
        step.map(|s| s.name.clone())
    }

    /// Filter `all_tools` down to what the active step permits, in input order.
    pub async fn get_allowed_tools(
        &self,
        config: &StepConfig,
        messages: &[Message],
        session_id: &str,
        all_tools: &[String],
    ) -> Vec<String> {
        let (step, state) = self.resolve(config, messages, session_id).await;
        let allowed = steps::allowed_tools(step, state.sequence_index, all_tools);
        debug!(
            session_id,
            step = step.map(|s| s.name.as_str()).unwrap_or("-"),
            sequence_index = state.sequence_index,
            allowed = allowed.len(),
            requested = all_tools.len(),
            "Filtered tools"
        );
        allowed
    }

    /// Record a tool call: push it onto the recent list and advance the
    /// active step's sequence when it is the expected tool.
    pub async fn process_tool_usage(
        &self,
        config: &StepConfig,
        messages: &[Message],
        session_id: &str,
        tool: &str,
    ) -> OrchestrationState {
        let cap = self.recent_tools_cap;
        let result = self
            .store
            .update_state(session_id, |state| {
                steps::record_tool_usage(config, messages, state, tool, cap)
            })
            .await;

        match result {
            Ok(state) => {
                debug!(
                    session_id,
                    tool,
                    sequence_index = state.sequence_index,
                    "Recorded tool usage"
                );
                state
            }
            Err(e) => {
                warn!(session_id, tool, error = %e, "Failed to record tool usage");
                steps::record_tool_usage(
                    config,
                    messages,
                    OrchestrationState::fresh(session_id),
                    tool,
                    cap,
                )
            }
        }
    }

    /// Fold one call's usage into the session's cumulative totals.
    pub async fn record_token_usage(
        &self,
        session_id: &str,
        usage: &TokenUsage,
    ) -> OrchestrationState {
        match self
            .store
            .update_state(session_id, |mut state| {
                state.add_usage(usage);
                state
            })
            .await
        {
            Ok(state) => {
                info!(
                    session_id,
                    provider = %usage.provider,
                    total_tokens = usage.total_tokens,
                    cumulative_tokens = state.cumulative_token_usage.total_tokens,
                    "Recorded token usage"
                );
                state
            }
            Err(e) => {
                warn!(session_id, error = %e, "Failed to record token usage");
                let mut state = OrchestrationState::fresh(session_id);
                state.add_usage(usage);
                state
            }
        }
    }

    pub async fn reset_state(&self, session_id: &str) {
        match self.store.reset_state(session_id).await {
            Ok(()) => info!(session_id, "Session state reset"),
            Err(e) => warn!(session_id, error = %e, "Failed to reset session state"),
        }
    }

    /// The client-visible subset of the current state.
    pub async fn snapshot(&self, session_id: &str) -> OrchestrationSnapshot {
        self.get_state(session_id).await.snapshot()
    }

    /// Resolve the active step against current state, entering it (index 0)
    /// when it differs from the persisted one.
    async fn resolve<'c>(
        &self,
        config: &'c StepConfig,
        messages: &[Message],
        session_id: &str,
    ) -> (Option<&'c Step>, OrchestrationState) {
        let mut state = self.get_state(session_id).await;
        let step = steps::resolve_step(config, messages, &state);

        if steps::enter_step(&mut state, step) {
            let name = state.active_step.clone();
            info!(session_id, step = name.as_deref().unwrap_or("-"), "Active step changed");
            match self
                .store
                .update_state(session_id, |mut stored| {
                    if stored.active_step != name {
                        stored.active_step = name;
                        stored.sequence_index = 0;
                    }
                    stored
                })
                .await
            {
                Ok(stored) => state = stored,
                Err(e) => warn!(session_id, error = %e, "Failed to persist active step"),
            }
        }
        (step, state)
    }
}
