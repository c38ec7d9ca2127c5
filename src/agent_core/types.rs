//! Shared types for the agent core.
//!
//! These are serialized for a presentation layer to consume, so field
//! names follow the `snake_case` JSON convention.

use serde::{Deserialize, Serialize};

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// No warm server / primed prompt yet.
    Cold,
    /// First generation since cold is in flight.
    ColdProcessing,
    /// Warm and idle.
    Ready,
    /// A generation is in flight on a warm agent.
    Processing,
}

impl AgentStatus {
    /// Whether a generation is in flight.
    pub fn is_processing(self) -> bool {
        matches!(self, AgentStatus::Processing | AgentStatus::ColdProcessing)
    }

    /// The status a generation enters from this one.
    pub fn processing_from(self) -> Self {
        match self {
            AgentStatus::Cold => AgentStatus::ColdProcessing,
            _ => AgentStatus::Processing,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AgentStatus::Cold => "cold",
            AgentStatus::ColdProcessing => "cold_processing",
            AgentStatus::Ready => "ready",
            AgentStatus::Processing => "processing",
        };
        f.write_str(label)
    }
}

/// An update to an agent's observable state.
///
/// Each event carries the full new value, so a subscriber never has to
/// reassemble state from deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    StatusChanged { status: AgentStatus },
    PendingMessage { text: String },
}

/// Point-in-time copy of an agent's observable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub status: AgentStatus,
    pub pending_message: String,
    pub warmup_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_from() {
        assert_eq!(AgentStatus::Cold.processing_from(), AgentStatus::ColdProcessing);
        assert_eq!(AgentStatus::Ready.processing_from(), AgentStatus::Processing);
        assert!(AgentStatus::ColdProcessing.is_processing());
        assert!(!AgentStatus::Ready.is_processing());
    }

    #[test]
    fn test_event_serialization() {
        let event = AgentEvent::StatusChanged {
            status: AgentStatus::ColdProcessing,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["status"], "cold_processing");

        let json = serde_json::to_value(AgentEvent::PendingMessage { text: "Hi".into() }).unwrap();
        assert_eq!(json["type"], "pending_message");
        assert_eq!(json["text"], "Hi");
    }
}
