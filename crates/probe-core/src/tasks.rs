//! Phase and task lifecycle operations.
//!
//! Everything here is pure: the planner feeds oracle output in, these
//! methods decide which task moves where.

use crate::types::{
    Phase, PhaseStatus, PhaseSummary, ReselectPolicy, Task, TaskOutcome, TaskStatus,
};

/// Name of the first, fixed phase.
pub const SEED_PHASE_NAME: &str = "Environment identification";

/// Descriptions are cut to this many characters when frozen into a summary.
const SUMMARY_DESCRIPTION_CHARS: usize = 80;

/// What the stuck handler decided for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckAction {
    /// Not essential for the phase: give up on it.
    Skip,
    /// The goal was reached well enough despite the trouble.
    Complete,
    /// Essential: rewrite it and try again later.
    Retry,
}

impl StuckAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Complete => "complete",
            Self::Retry => "retry",
        }
    }
}

/// A validated stuck verdict, ready to apply to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckResolution {
    pub action: StuckAction,
    /// Outcome summary for `Skip` and `Complete`.
    pub summary: String,
    /// Replacement description for `Retry`; keeps the old one when absent.
    pub new_description: Option<String>,
}

/// The task chosen by [`Phase::select_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub index: usize,
    /// True when an interrupted `in_progress` task was picked up again.
    pub resumed: bool,
}

/// The fixed task set for phase 1.
pub fn seed_tasks() -> Vec<Task> {
    vec![
        Task::new(
            "P1-T1",
            "Observe the server's initial output and decide whether this connection \
             is a text-based interactive environment. Binary or undecodable output \
             means the environment is not text based.",
        ),
        Task::new(
            "P1-T2",
            "If the environment is text based, identify what kind of interactive \
             environment it is: text MUD, chat system, Linux shell, LLM question \
             answering endpoint, BBS, or something else. Use the output format, \
             prompts and welcome banner as evidence.",
        ),
    ]
}

impl Phase {
    pub fn new(number: u32, name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            number,
            name: name.into(),
            tasks,
            status: PhaseStatus::Active,
        }
    }

    /// Phase 1 before any tasks have been assigned.
    pub fn initial() -> Self {
        Self::new(1, SEED_PHASE_NAME, Vec::new())
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn in_progress_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count()
    }

    /// Ids of tasks waiting for a stuck verdict.
    pub fn stuck_task_ids(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Stuck)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Every task is completed or skipped, and there is at least one.
    pub fn is_complete(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Pick the next task and mark it `in_progress`.
    ///
    /// An interrupted `in_progress` task wins over any pending one. With
    /// `ReselectPolicy::Reset` its attempt counter starts over.
    pub fn select_next(&mut self, policy: ReselectPolicy) -> Option<Selection> {
        if let Some(index) = self
            .tasks
            .iter()
            .position(|t| t.status == TaskStatus::InProgress)
        {
            if policy == ReselectPolicy::Reset {
                self.tasks[index].attempts = 0;
            }
            return Some(Selection {
                index,
                resumed: true,
            });
        }

        let index = self
            .tasks
            .iter()
            .position(|t| t.status == TaskStatus::Pending)?;
        let task = &mut self.tasks[index];
        task.status = TaskStatus::InProgress;
        task.attempts = 0;
        Some(Selection {
            index,
            resumed: false,
        })
    }

    /// Count one scheduler cycle against a task. Returns the new total.
    pub fn record_attempt(&mut self, id: &str) -> Option<u32> {
        let task = self.task_mut(id)?;
        task.attempts = task.attempts.saturating_add(1);
        Some(task.attempts)
    }

    /// Mark a task completed with its result. Returns false for unknown ids.
    pub fn complete_task(&mut self, id: &str, result: impl Into<String>) -> bool {
        let Some(task) = self.task_mut(id) else {
            return false;
        };
        task.status = TaskStatus::Completed;
        task.result = Some(result.into());
        task.attempts = 0;
        true
    }

    /// Mark a task stuck. Returns false for unknown ids.
    pub fn mark_stuck(&mut self, id: &str) -> bool {
        let Some(task) = self.task_mut(id) else {
            return false;
        };
        task.status = TaskStatus::Stuck;
        task.attempts = 0;
        true
    }

    /// Apply a stuck verdict to a task.
    pub fn apply_resolution(&mut self, id: &str, resolution: &StuckResolution) -> bool {
        let Some(task) = self.task_mut(id) else {
            return false;
        };
        task.attempts = 0;
        match resolution.action {
            StuckAction::Skip => {
                task.status = TaskStatus::Skipped;
                task.result = Some(format!("(skipped) {}", resolution.summary));
            }
            StuckAction::Complete => {
                task.status = TaskStatus::Completed;
                task.result = Some(format!("(partially completed) {}", resolution.summary));
            }
            StuckAction::Retry => {
                task.status = TaskStatus::Pending;
                if let Some(description) = resolution
                    .new_description
                    .as_deref()
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                {
                    task.description = description.to_string();
                }
                task.plan = None;
                task.result = None;
            }
        }
        true
    }

    /// Results of all tasks that have one, joined for prompt use.
    pub fn key_findings(&self) -> String {
        let findings: Vec<String> = self
            .tasks
            .iter()
            .filter_map(|t| {
                t.result
                    .as_deref()
                    .filter(|r| !r.is_empty())
                    .map(|r| format!("[{}] {r}", t.id))
            })
            .collect();
        if findings.is_empty() {
            "none".to_string()
        } else {
            findings.join("; ")
        }
    }

    /// Freeze this phase into an immutable summary.
    pub fn summarize(&self) -> PhaseSummary {
        PhaseSummary {
            number: self.number,
            name: self.name.clone(),
            outcomes: self
                .tasks
                .iter()
                .map(|t| TaskOutcome {
                    id: t.id.clone(),
                    description: truncate_chars(&t.description, SUMMARY_DESCRIPTION_CHARS),
                    status: t.status,
                    result: t.result.clone(),
                })
                .collect(),
            key_findings: self.key_findings(),
        }
    }
}

/// Cut a string to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_phase() -> Phase {
        Phase::new(
            2,
            "Exploration",
            vec![
                Task::new("P2-T1", "list commands"),
                Task::new("P2-T2", "find the map"),
                Task::new("P2-T3", "talk to someone"),
            ],
        )
    }

    #[test]
    fn seed_phase_has_two_pending_tasks() {
        let tasks = seed_tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "P1-T1");
        assert_eq!(tasks[1].id, "P1-T2");
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[test]
    fn select_next_takes_first_pending_in_order() {
        let mut phase = create_test_phase();
        let selection = phase.select_next(ReselectPolicy::Preserve).unwrap();
        assert_eq!(selection.index, 0);
        assert!(!selection.resumed);
        assert_eq!(phase.tasks[0].status, TaskStatus::InProgress);
        assert_eq!(phase.in_progress_count(), 1);
    }

    #[test]
    fn select_next_prefers_interrupted_task() {
        let mut phase = create_test_phase();
        phase.tasks[1].status = TaskStatus::InProgress;
        phase.tasks[1].attempts = 7;
        phase.tasks[1].plan = Some("look around".to_string());

        let selection = phase.select_next(ReselectPolicy::Preserve).unwrap();
        assert_eq!(selection.index, 1);
        assert!(selection.resumed);
        assert_eq!(phase.tasks[1].attempts, 7);
        assert_eq!(phase.tasks[1].plan.as_deref(), Some("look around"));
        assert_eq!(phase.in_progress_count(), 1);
    }

    #[test]
    fn select_next_reset_policy_clears_attempts() {
        let mut phase = create_test_phase();
        phase.tasks[1].status = TaskStatus::InProgress;
        phase.tasks[1].attempts = 7;

        phase.select_next(ReselectPolicy::Reset).unwrap();
        assert_eq!(phase.tasks[1].attempts, 0);
    }

    #[test]
    fn select_next_returns_none_when_nothing_runnable() {
        let mut phase = create_test_phase();
        for task in &mut phase.tasks {
            task.status = TaskStatus::Completed;
        }
        assert!(phase.select_next(ReselectPolicy::Preserve).is_none());
    }

    #[test]
    fn completion_requires_terminal_and_nonempty() {
        let mut phase = create_test_phase();
        assert!(!phase.is_complete());

        phase.tasks[0].status = TaskStatus::Completed;
        phase.tasks[1].status = TaskStatus::Skipped;
        assert!(!phase.is_complete());

        phase.tasks[2].status = TaskStatus::Completed;
        assert!(phase.is_complete());

        assert!(!Phase::initial().is_complete());
    }

    #[test]
    fn leaving_in_progress_zeroes_attempts() {
        let mut phase = create_test_phase();
        phase.select_next(ReselectPolicy::Preserve);
        phase.record_attempt("P2-T1");
        phase.record_attempt("P2-T1");
        assert_eq!(phase.tasks[0].attempts, 2);

        assert!(phase.complete_task("P2-T1", "found help"));
        assert_eq!(phase.tasks[0].attempts, 0);
        assert_eq!(phase.tasks[0].result.as_deref(), Some("found help"));

        phase.select_next(ReselectPolicy::Preserve);
        phase.record_attempt("P2-T2");
        assert!(phase.mark_stuck("P2-T2"));
        assert_eq!(phase.tasks[1].status, TaskStatus::Stuck);
        assert_eq!(phase.tasks[1].attempts, 0);
    }

    #[test]
    fn apply_resolution_skip_and_complete_set_results() {
        let mut phase = create_test_phase();
        phase.tasks[0].status = TaskStatus::Stuck;
        phase.tasks[1].status = TaskStatus::Stuck;

        phase.apply_resolution(
            "P2-T1",
            &StuckResolution {
                action: StuckAction::Skip,
                summary: "no help system".to_string(),
                new_description: None,
            },
        );
        phase.apply_resolution(
            "P2-T2",
            &StuckResolution {
                action: StuckAction::Complete,
                summary: "map printed".to_string(),
                new_description: None,
            },
        );

        assert_eq!(phase.tasks[0].status, TaskStatus::Skipped);
        assert_eq!(phase.tasks[0].result.as_deref(), Some("(skipped) no help system"));
        assert_eq!(phase.tasks[1].status, TaskStatus::Completed);
        assert_eq!(
            phase.tasks[1].result.as_deref(),
            Some("(partially completed) map printed")
        );
    }

    #[test]
    fn apply_resolution_retry_rewrites_and_clears_plan() {
        let mut phase = create_test_phase();
        phase.tasks[2].status = TaskStatus::Stuck;
        phase.tasks[2].plan = Some("say hi".to_string());
        phase.tasks[2].result = Some("nobody answered".to_string());

        phase.apply_resolution(
            "P2-T3",
            &StuckResolution {
                action: StuckAction::Retry,
                summary: String::new(),
                new_description: Some("use the 'who' command first".to_string()),
            },
        );

        let task = &phase.tasks[2];
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.description, "use the 'who' command first");
        assert!(task.plan.is_none());
        assert!(task.result.is_none());
    }

    #[test]
    fn retry_without_description_keeps_old_one() {
        let mut phase = create_test_phase();
        phase.tasks[0].status = TaskStatus::Stuck;
        phase.apply_resolution(
            "P2-T1",
            &StuckResolution {
                action: StuckAction::Retry,
                summary: String::new(),
                new_description: Some("   ".to_string()),
            },
        );
        assert_eq!(phase.tasks[0].description, "list commands");
    }

    #[test]
    fn summarize_truncates_descriptions_and_collects_findings() {
        let mut phase = create_test_phase();
        phase.tasks[0].description = "x".repeat(200);
        phase.tasks[0].result = Some("help works".to_string());
        phase.tasks[1].result = Some("map found".to_string());

        let summary = phase.summarize();
        assert_eq!(summary.number, 2);
        assert_eq!(summary.outcomes.len(), 3);
        assert_eq!(summary.outcomes[0].description.chars().count(), 80);
        assert_eq!(summary.key_findings, "[P2-T1] help works; [P2-T2] map found");
    }

    #[test]
    fn key_findings_without_results_is_none() {
        assert_eq!(create_test_phase().key_findings(), "none");
    }

    #[test]
    fn truncate_chars_respects_multibyte() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
