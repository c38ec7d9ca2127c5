//! Agent Core — the conversational agent and its state machine.
//!
//! Submodules:
//! - `agent`: Running prompt, pending message, status, interrupt, warmup
//! - `template`: Rendering message history into a completion prompt
//! - `types`: Status, events and snapshots shared with observers
//! - `errors`: Agent-level error types

pub mod agent;
pub mod errors;
pub mod template;
pub mod types;

// Re-exports for convenience
pub use agent::{Agent, DEFAULT_EVENT_CAPACITY, DEFAULT_SYSTEM_PROMPT};
pub use errors::AgentError;
pub use template::{Template, TemplateFormat};
pub use types::{AgentEvent, AgentSnapshot, AgentStatus};
