//! Step state machine: pure functions over `StepConfig`, conversation
//! history, and a session's `OrchestrationState`.
//!
//! Nothing here touches storage; `OrchestrationManager` wraps these in
//! read/compute/write cycles.

use tandem_core::message::{Message, last_user_content};
use tandem_core::session::OrchestrationState;
use tandem_core::step::{Step, StepCondition, StepConfig};

/// Whether a single condition holds.
pub fn condition_holds(
    condition: &StepCondition,
    messages: &[Message],
    state: &OrchestrationState,
) -> bool {
    match condition {
        StepCondition::ToolUsed { tool } => state.recently_used_tools.iter().any(|t| t == tool),
        StepCondition::ToolNotUsed { tool } => {
            !state.recently_used_tools.iter().any(|t| t == tool)
        }
        StepCondition::LastToolWas { tool } => {
            state.recently_used_tools.first().is_some_and(|t| t == tool)
        }
        StepCondition::MinMessages { count } => messages.len() >= *count,
        StepCondition::MaxMessages { count } => messages.len() <= *count,
        StepCondition::MessageContains { text } => last_user_content(messages)
            .is_some_and(|content| content.to_lowercase().contains(&text.to_lowercase())),
        StepCondition::MinSequenceIndex { index } => state.sequence_index >= *index,
    }
}

/// Resolve the active step.
///
/// The first step, in declaration order, whose conditions all hold wins.
/// Otherwise the step flagged `is_default`, otherwise the first step.
/// `None` only when the config has no steps.
pub fn resolve_step<'a>(
    config: &'a StepConfig,
    messages: &[Message],
    state: &OrchestrationState,
) -> Option<&'a Step> {
    config
        .steps
        .iter()
        .find(|step| {
            step.conditions
                .iter()
                .all(|c| condition_holds(c, messages, state))
        })
        .or_else(|| config.steps.iter().find(|s| s.is_default))
        .or_else(|| config.steps.first())
}

/// Move `state` onto `step`. A change of step restarts its sequence.
/// Returns whether anything changed.
pub fn enter_step(state: &mut OrchestrationState, step: Option<&Step>) -> bool {
    let name = step.map(|s| s.name.as_str());
    if state.active_step.as_deref() == name {
        return false;
    }
    state.active_step = name.map(str::to_string);
    state.sequence_index = 0;
    true
}

/// The tool a step's sequence currently demands, if the sequence still
/// constrains the step at `index`.
pub fn sequenced_tool(step: &Step, index: usize) -> Option<&str> {
    step.sequence.get(index).map(String::as_str)
}

/// Filter `all_tools` for the active step, keeping input order.
///
/// An unfinished sequence overrides allow/deny and admits only the tool at
/// `index` (when it was requested at all). Otherwise `denied` is removed
/// first, then the result is narrowed to `allowed`.
pub fn allowed_tools(step: Option<&Step>, index: usize, all_tools: &[String]) -> Vec<String> {
    let Some(step) = step else {
        return all_tools.to_vec();
    };

    if let Some(required) = sequenced_tool(step, index) {
        return all_tools
            .iter()
            .filter(|t| t.as_str() == required)
            .cloned()
            .collect();
    }

    let Some(available) = &step.available_tools else {
        return all_tools.to_vec();
    };

    all_tools
        .iter()
        .filter(|t| {
            available
                .denied
                .as_ref()
                .is_none_or(|denied| !denied.contains(t))
        })
        .filter(|t| {
            available
                .allowed
                .as_ref()
                .is_none_or(|allowed| allowed.contains(t))
        })
        .cloned()
        .collect()
}

/// Record one tool call against `state`.
///
/// The tool is pushed onto the recent list. The sequence index advances
/// only when `tool` is the one the sequence expects; at the end it wraps
/// to 0 for repeating steps and otherwise stays at the sequence length.
pub fn record_tool_usage(
    config: &StepConfig,
    messages: &[Message],
    mut state: OrchestrationState,
    tool: &str,
    recent_tools_cap: usize,
) -> OrchestrationState {
    let step = resolve_step(config, messages, &state);
    enter_step(&mut state, step);
    state.push_recent_tool(tool, recent_tools_cap);

    if let Some(step) = step {
        if sequenced_tool(step, state.sequence_index) == Some(tool) {
            let next = state.sequence_index + 1;
            state.sequence_index = if next >= step.sequence.len() && step.repeat_sequence {
                0
            } else {
                next
            };
        }
    }
    state
}
