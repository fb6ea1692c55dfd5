//! Core types for the exploration agent.
//!
//! Phases own an ordered task list; knowledge entries are scoped to the phase
//! that produced them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for connection sessions and journal events.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Stuck,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Stuck => "stuck",
            Self::Skipped => "skipped",
        }
    }

    /// Terminal statuses count towards phase completion.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Phase lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Active,
    Completed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

/// Classification of the remote service.
///
/// `NonText` is the terminal kind: once the active phase is done the agent
/// exits instead of planning another phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    #[default]
    Unknown,
    Mud,
    Shell,
    Chat,
    LlmQa,
    Bbs,
    Other,
    NonText,
}

impl EnvironmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Mud => "mud",
            Self::Shell => "shell",
            Self::Chat => "chat",
            Self::LlmQa => "llm_qa",
            Self::Bbs => "bbs",
            Self::Other => "other",
            Self::NonText => "non_text",
        }
    }

    /// Parse an oracle-reported classification.
    ///
    /// Empty and `null` mean "not classified this turn" and yield `None`.
    /// Labels we don't know are kept as `Other` rather than rejected.
    pub fn parse(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let kind = match normalized.as_str() {
            "" | "null" | "none" => return None,
            "unknown" => Self::Unknown,
            "mud" => Self::Mud,
            "shell" => Self::Shell,
            "chat" => Self::Chat,
            "llm_qa" => Self::LlmQa,
            "bbs" => Self::Bbs,
            "non_text" | "nontext" => Self::NonText,
            _ => Self::Other,
        };
        Some(kind)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NonText)
    }
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an interrupted `in_progress` task's attempt counter is treated when it
/// is re-selected after a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReselectPolicy {
    /// Keep the attempts accumulated before the connection dropped.
    #[default]
    Preserve,
    /// Start counting from zero again.
    Reset,
}

impl ReselectPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preserve => "preserve",
            Self::Reset => "reset",
        }
    }
}

// --- Core Types ---

/// A unit of work inside a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique within its phase (e.g. `P2-T3`).
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    /// Execution plan drafted when the task is assigned.
    pub plan: Option<String>,
    /// Outcome summary once the task is completed or skipped.
    pub result: Option<String>,
    /// Scheduler cycles spent on the task since it last entered `in_progress`.
    pub attempts: u32,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            plan: None,
            result: None,
            attempts: 0,
        }
    }
}

/// A named stage of the exploration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// Starts at 1 and only ever increases.
    pub number: u32,
    pub name: String,
    pub tasks: Vec<Task>,
    pub status: PhaseStatus,
}

/// Frozen outcome of one task of a completed phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub id: String,
    /// Description truncated for prompt use.
    pub description: String,
    pub status: TaskStatus,
    pub result: Option<String>,
}

/// Immutable record of a completed phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub number: u32,
    pub name: String,
    pub outcomes: Vec<TaskOutcome>,
    pub key_findings: String,
}

/// A tagged fact learned from the interaction.
///
/// Only `content` and `category` are persisted; `origin_phase` is assigned
/// when the entry is loaded or produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub content: String,
    /// Free-form tag proposed by the oracle (e.g. `input_triggered`).
    pub category: String,
    #[serde(skip)]
    pub origin_phase: u32,
}

impl KnowledgeEntry {
    pub fn new(content: impl Into<String>, category: impl Into<String>, origin_phase: u32) -> Self {
        Self {
            content: content.into(),
            category: category.into(),
            origin_phase,
        }
    }
}

/// Category assigned to entries that arrive without one.
pub const UNKNOWN_CATEGORY: &str = "unknown";
