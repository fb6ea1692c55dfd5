//! Journal event types.
//!
//! Every connection session appends to the journal; payloads are stored as
//! JSON next to their event type name.

use crate::types::{EnvironmentKind, Id, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    SessionStarted,
    SessionEnded,
    PhaseStarted,
    PhaseCompleted,
    TaskAssigned,
    TaskCompleted,
    TaskStuck,
    StuckResolved,
    CommandSent,
    KnowledgeUpdated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "SESSION_STARTED",
            Self::SessionEnded => "SESSION_ENDED",
            Self::PhaseStarted => "PHASE_STARTED",
            Self::PhaseCompleted => "PHASE_COMPLETED",
            Self::TaskAssigned => "TASK_ASSIGNED",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::TaskStuck => "TASK_STUCK",
            Self::StuckResolved => "STUCK_RESOLVED",
            Self::CommandSent => "COMMAND_SENT",
            Self::KnowledgeUpdated => "KNOWLEDGE_UPDATED",
        }
    }
}

/// A stored journal row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    pub id: Id,
    /// One session per successful connect.
    pub session_id: Id,
    /// Event type name (e.g., `TASK_ASSIGNED`).
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartedPayload {
    pub target: String,
    pub phase: u32,
    pub phase_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndedPayload {
    /// `stopped`, `exited`, `reconnect` or `error`.
    pub outcome: String,
    pub phase: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseStartedPayload {
    pub phase: u32,
    pub name: String,
    pub task_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCompletedPayload {
    pub phase: u32,
    pub name: String,
    pub key_findings: String,
    pub environment: EnvironmentKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignedPayload {
    pub phase: u32,
    pub task_id: String,
    pub description: String,
    /// Picked up again after a reconnect.
    pub resumed: bool,
    pub plan: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletedPayload {
    pub phase: u32,
    pub task_id: String,
    pub result: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStuckPayload {
    pub phase: u32,
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckResolvedPayload {
    pub phase: u32,
    pub task_id: String,
    /// `skip`, `complete` or `retry`.
    pub action: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSentPayload {
    pub phase: u32,
    pub task_id: Option<String>,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeUpdatedPayload {
    pub phase: u32,
    pub added: usize,
    pub total: usize,
    pub counter: u32,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    SessionStarted(SessionStartedPayload),
    SessionEnded(SessionEndedPayload),
    PhaseStarted(PhaseStartedPayload),
    PhaseCompleted(PhaseCompletedPayload),
    TaskAssigned(TaskAssignedPayload),
    TaskCompleted(TaskCompletedPayload),
    TaskStuck(TaskStuckPayload),
    StuckResolved(StuckResolvedPayload),
    CommandSent(CommandSentPayload),
    KnowledgeUpdated(KnowledgeUpdatedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::SessionStarted(_) => EventType::SessionStarted,
            Self::SessionEnded(_) => EventType::SessionEnded,
            Self::PhaseStarted(_) => EventType::PhaseStarted,
            Self::PhaseCompleted(_) => EventType::PhaseCompleted,
            Self::TaskAssigned(_) => EventType::TaskAssigned,
            Self::TaskCompleted(_) => EventType::TaskCompleted,
            Self::TaskStuck(_) => EventType::TaskStuck,
            Self::StuckResolved(_) => EventType::StuckResolved,
            Self::CommandSent(_) => EventType::CommandSent,
            Self::KnowledgeUpdated(_) => EventType::KnowledgeUpdated,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&EventType::TaskAssigned).unwrap(),
            "\"TASK_ASSIGNED\""
        );
        assert_eq!(EventType::KnowledgeUpdated.as_str(), "KNOWLEDGE_UPDATED");
    }

    #[test]
    fn stuck_resolved_payload_serializes_status() {
        let payload = EventPayload::StuckResolved(StuckResolvedPayload {
            phase: 2,
            task_id: "P2-T1".to_string(),
            action: "retry".to_string(),
            status: TaskStatus::Pending,
        });
        assert_eq!(payload.event_type(), EventType::StuckResolved);
        let json = payload.to_json().unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("P2-T1"));
    }

    #[test]
    fn phase_completed_payload_carries_environment() {
        let payload = PhaseCompletedPayload {
            phase: 1,
            name: "Environment identification".to_string(),
            key_findings: "[P1-T1] text".to_string(),
            environment: EnvironmentKind::Mud,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"environment\":\"mud\""));
    }
}
