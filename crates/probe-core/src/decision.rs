//! Typed oracle replies.
//!
//! Every oracle call parses into one of these records and is checked with
//! [`OracleReply::is_acceptable`] before anything downstream trusts it.
//! Field names match the JSON keys the prompts ask for.

use crate::tasks::{StuckAction, StuckResolution};
use crate::types::{EnvironmentKind, KnowledgeEntry, Task, UNKNOWN_CATEGORY};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;

/// A parsed oracle reply with its structural check.
pub trait OracleReply: DeserializeOwned + Send {
    /// Whether the reply is usable. Rejected replies are retried.
    fn is_acceptable(&self) -> bool {
        true
    }
}

/// Accept `true`, `"true"`, `1` and friends; anything else is false.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Bool(b)) => b,
        Some(serde_json::Value::String(s)) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1")
        }
        Some(serde_json::Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    })
}

/// Keep the items that parse as `T`, drop the rest.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let values = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(values
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect())
}

/// Strings that mean "nothing" are folded into `None`.
fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty() && *s != "null")
}

/// Per-cycle decision: what to send and how the task is going.
#[derive(Debug, Clone, Deserialize)]
pub struct Decision {
    pub analysis: String,
    #[serde(default)]
    pub next_payload: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub task_completed: bool,
    #[serde(default)]
    pub task_result: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub task_stuck: bool,
    #[serde(default)]
    pub stuck_reason: Option<String>,
    #[serde(default)]
    pub environment_type: Option<String>,
}

impl Decision {
    /// Payload to send, empty when the oracle chose to stay quiet.
    pub fn payload(&self) -> &str {
        self.next_payload.as_deref().unwrap_or_default()
    }

    pub fn result(&self) -> String {
        self.task_result.as_deref().unwrap_or_default().trim().to_string()
    }

    pub fn environment(&self) -> Option<EnvironmentKind> {
        self.environment_type.as_deref().and_then(EnvironmentKind::parse)
    }

    pub fn stuck_reason(&self) -> Option<&str> {
        non_empty(self.stuck_reason.as_deref())
    }
}

impl OracleReply for Decision {}

/// One task proposed for a new phase.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannedTask {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// Oracle-generated task list for a phase.
#[derive(Debug, Clone, Deserialize)]
pub struct PhasePlan {
    #[serde(default)]
    pub phase_name: Option<String>,
    #[serde(default)]
    pub status_summary: Option<String>,
    #[serde(default)]
    pub gap_analysis: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub tasks: Vec<PlannedTask>,
}

impl PhasePlan {
    /// Materialize the plan as pending tasks.
    ///
    /// Tasks without a description are dropped. Given ids are kept unless
    /// repeated; the rest get the lowest free `P{phase}-T{n}`, so ids stay
    /// unique within the phase.
    pub fn into_tasks(self, phase: u32) -> Vec<Task> {
        let planned: Vec<PlannedTask> = self
            .tasks
            .into_iter()
            .filter(|t| !t.description.trim().is_empty())
            .collect();

        let mut taken = HashSet::new();
        let given: Vec<Option<String>> = planned
            .iter()
            .map(|t| {
                non_empty(t.id.as_deref())
                    .filter(|id| taken.insert((*id).to_string()))
                    .map(str::to_string)
            })
            .collect();

        let mut next = 1;
        planned
            .into_iter()
            .zip(given)
            .map(|(t, id)| {
                let id = id.unwrap_or_else(|| loop {
                    let candidate = format!("P{phase}-T{next}");
                    next += 1;
                    if taken.insert(candidate.clone()) {
                        break candidate;
                    }
                });
                Task::new(id, t.description.trim())
            })
            .collect()
    }
}

impl OracleReply for PhasePlan {
    fn is_acceptable(&self) -> bool {
        self.tasks.iter().any(|t| !t.description.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhaseName {
    pub phase_name: String,
}

impl OracleReply for PhaseName {
    fn is_acceptable(&self) -> bool {
        !self.phase_name.trim().is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionPlan {
    pub plan: String,
}

impl OracleReply for ExecutionPlan {
    fn is_acceptable(&self) -> bool {
        !self.plan.trim().is_empty()
    }
}

/// Verdict for a task that stopped making progress.
#[derive(Debug, Clone, Deserialize)]
pub struct StuckVerdict {
    pub action: String,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub new_description: Option<String>,
    #[serde(default)]
    pub result_summary: Option<String>,
}

impl StuckVerdict {
    pub fn action(&self) -> Option<StuckAction> {
        match self.action.trim().to_ascii_lowercase().as_str() {
            "skip" | "skipped" => Some(StuckAction::Skip),
            "completed" | "complete" | "partial" => Some(StuckAction::Complete),
            "pending" | "retry" => Some(StuckAction::Retry),
            _ => None,
        }
    }

    /// Turn the verdict into a resolution; `reason` stands in for a missing
    /// summary.
    pub fn resolution(&self, reason: &str) -> Option<StuckResolution> {
        let action = self.action()?;
        Some(StuckResolution {
            action,
            summary: non_empty(self.result_summary.as_deref())
                .unwrap_or(reason)
                .to_string(),
            new_description: non_empty(self.new_description.as_deref()).map(str::to_string),
        })
    }
}

impl OracleReply for StuckVerdict {
    fn is_acceptable(&self) -> bool {
        self.action().is_some()
    }
}

/// A knowledge candidate as the oracle phrased it.
#[derive(Debug, Clone, Deserialize)]
pub struct ProposedEntry {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
}

impl ProposedEntry {
    fn into_entry(self, phase: u32) -> Option<KnowledgeEntry> {
        let content = self.content.trim();
        if content.is_empty() {
            return None;
        }
        let category = non_empty(self.category.as_deref()).unwrap_or(UNKNOWN_CATEGORY);
        Some(KnowledgeEntry::new(content, category, phase))
    }
}

fn to_entries(proposed: Vec<ProposedEntry>, phase: u32) -> Vec<KnowledgeEntry> {
    proposed
        .into_iter()
        .filter_map(|p| p.into_entry(phase))
        .collect()
}

/// New facts extracted from recent history.
#[derive(Debug, Clone, Deserialize)]
pub struct FactProposal {
    #[serde(default)]
    pub kb_focus: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub new_entries: Vec<ProposedEntry>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub keywords: Vec<String>,
}

impl FactProposal {
    pub fn into_entries(self, phase: u32) -> Vec<KnowledgeEntry> {
        to_entries(self.new_entries, phase)
    }
}

impl OracleReply for FactProposal {}

/// Full rewrite of a phase's knowledge list.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsolidatedKnowledge {
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub consolidated_entries: Vec<ProposedEntry>,
}

impl ConsolidatedKnowledge {
    /// Entries with content; may be empty, in which case the rewrite is ignored.
    pub fn into_entries(self, phase: u32) -> Vec<KnowledgeEntry> {
        to_entries(self.consolidated_entries, phase)
    }
}

impl OracleReply for ConsolidatedKnowledge {}
