//! # tandem core
//!
//! Domain types, traits, and error definitions for the tandem orchestration
//! engine. Every subsystem is defined as a trait or plain data here;
//! implementations live in their respective crates:
//!
//! - `StorageProvider` → `tandem-storage`
//! - session store and step state machine → `tandem-orchestration`
//! - `Provider` / `Llm` → `tandem-providers`
//! - the turn engine → `tandem-agent`

pub mod classify;
pub mod error;
pub mod llm;
pub mod message;
pub mod provider;
pub mod session;
pub mod step;
pub mod storage;
pub mod stream;
pub mod tool;
pub mod usage;

// Re-export key types at crate root for ergonomics
pub use classify::{ErrorClass, classify_error, classify_message, normalize_error_message};
pub use error::{ConfigurationError, Error, ProviderError, Result, StorageError, ToolError};
pub use llm::{GenerateObjectResult, GenerateTextResult, Llm, StreamObjectResult};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition};
pub use session::{OrchestrationSnapshot, OrchestrationState};
pub use step::{AvailableTools, Step, StepCondition, StepConfig};
pub use storage::StorageProvider;
pub use stream::{StepFinish, StepFinishCallback, StreamEvent, StreamFailure, StreamTextResult};
pub use tool::{Tool, ToolCall, ToolContext, ToolRegistry, ToolResult};
pub use usage::{TokenTotals, TokenUsage};
