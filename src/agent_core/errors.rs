//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;

/// Errors that can occur during agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A generation or warmup is already in flight on this agent.
    #[error("agent '{agent_id}' is busy with another generation")]
    Busy { agent_id: String },

    /// The generation was interrupted; `partial` is what had been streamed.
    #[error("generation interrupted after {} bytes", partial.len())]
    Interrupted { partial: String },

    /// The inference backend failed.
    #[error("inference failed: {source}")]
    Inference {
        #[source]
        source: InferenceError,
    },
}

impl AgentError {
    /// Whether this error came from an interrupt rather than a failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, AgentError::Interrupted { .. })
    }
}

impl From<InferenceError> for AgentError {
    fn from(e: InferenceError) -> Self {
        AgentError::Inference { source: e }
    }
}
