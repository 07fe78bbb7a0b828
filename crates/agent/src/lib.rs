//! The agent execution node: one conversational turn, end to end.
//!
//! A turn resolves a primary and an optional fallback LLM adapter, filters
//! the offered tools through the session's active step, runs the model
//! (with a bounded tool loop, streamed or not), and falls back to the
//! secondary adapter exactly once when the primary fails with a retryable
//! error. Token usage of the attempt that produced the answer is folded
//! into the session's cumulative totals.

pub mod adapters;
pub mod node;
pub mod streaming;
pub mod turn;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use adapters::{AdapterFactory, ProviderAdapterFactory, ResolvedAdapters};
pub use node::{AgentNode, DEFAULT_MAX_STEPS, DEFAULT_TIMEOUT};
pub use streaming::TurnStream;
pub use turn::{AdapterRole, StreamedTurn, TurnEvent, TurnLlmConfig, TurnOutcome, TurnRequest};
