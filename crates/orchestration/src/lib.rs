//! Session-scoped orchestration for tandem.
//!
//! - [`SessionStore`]: atomic, TTL-refreshing access to per-session state
//! - [`OrchestrationManager`]: the step state machine (active step
//!   resolution, tool filtering, sequence tracking, usage accounting)
//! - [`steps`]: the pure state-machine functions underneath

pub mod manager;
pub mod session;
pub mod steps;

pub use manager::{DEFAULT_RECENT_TOOLS_CAP, OrchestrationManager};
pub use session::{DEFAULT_KEY_PREFIX, SessionStore};

/// Response header echoing the session id.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Response header carrying the JSON [`tandem_core::OrchestrationSnapshot`].
pub const ORCHESTRATION_STATE_HEADER: &str = "x-orchestration-state";
