//! The mutable aggregate the scheduler threads through its states.
//!
//! Every transition produces an update record; applying it is the only way
//! the scheduler changes the state, which keeps each step's effect in one
//! place.

use crate::consolidation::{KnowledgeJob, KnowledgeReport, PendingConsolidation};
use crate::watchdog::TaskVerdict;
use probe_core::{EnvironmentKind, KnowledgeEntry, Phase, PhaseSummary, Task};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlFlags {
    pub reconnect_requested: bool,
    pub stop_requested: bool,
    pub exit_requested: bool,
    pub task_completed: bool,
    pub task_stuck: bool,
}

#[derive(Debug)]
pub struct RunState {
    pub raw_output: String,
    pub clean_output: String,
    /// Most recent interaction entries, oldest first.
    pub history: Vec<String>,
    max_history: usize,
    pub knowledge: Vec<KnowledgeEntry>,
    pub consolidation_counter: u32,
    pub phase: Phase,
    /// Id of the task being worked on.
    pub current_task: Option<String>,
    pub completed_phases: Vec<PhaseSummary>,
    pub environment: EnvironmentKind,
    pub analysis: String,
    pub payload: String,
    pub flags: ControlFlags,
    /// Reason attached to the last stuck verdict; survives reconnects so a
    /// task left stuck can still be resolved with it.
    pub stuck_reason: Option<String>,
    pub pending_consolidation: Option<PendingConsolidation>,
}

impl RunState {
    pub fn new(max_history: usize) -> Self {
        Self {
            raw_output: String::new(),
            clean_output: String::new(),
            history: Vec::new(),
            max_history,
            knowledge: Vec::new(),
            consolidation_counter: 0,
            phase: Phase::initial(),
            current_task: None,
            completed_phases: Vec::new(),
            environment: EnvironmentKind::Unknown,
            analysis: String::new(),
            payload: String::new(),
            flags: ControlFlags::default(),
            stuck_reason: None,
            pending_consolidation: None,
        }
    }

    pub fn current(&self) -> Option<&Task> {
        self.current_task
            .as_deref()
            .and_then(|id| self.phase.task(id))
    }

    pub fn push_history(&mut self, entry: String) {
        self.history.push(entry);
        if self.history.len() > self.max_history {
            let excess = self.history.len() - self.max_history;
            self.history.drain(..excess);
        }
    }

    /// Drop everything tied to the old connection. Phase, tasks, history and
    /// the counter survive; knowledge is replaced by what is on disk.
    pub fn reset_for_reconnect(&mut self, knowledge: Vec<KnowledgeEntry>) {
        self.raw_output.clear();
        self.clean_output.clear();
        self.payload.clear();
        self.flags = ControlFlags::default();
        if let Some(stale) = self.pending_consolidation.take() {
            debug!(
                phase = stale.phase(),
                "dropping consolidation result from the previous connection"
            );
        }
        self.knowledge = knowledge;
    }

    /// By-value copy of what the consolidation worker needs.
    pub fn knowledge_job(&self) -> KnowledgeJob {
        KnowledgeJob {
            phase: self.phase.number,
            phase_name: self.phase.name.clone(),
            history: self.history.clone(),
            knowledge: self.knowledge.clone(),
            tasks: self.phase.tasks.clone(),
            counter: self.consolidation_counter,
            output: self.clean_output.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserveUpdate {
    Received { raw: String, clean: String },
    Lost,
}

impl ObserveUpdate {
    pub fn apply(self, state: &mut RunState) {
        match self {
            Self::Received { raw, clean } => {
                state.raw_output = raw;
                state.clean_output = clean;
            }
            Self::Lost => {
                state.raw_output.clear();
                state.clean_output.clear();
                state.flags.reconnect_requested = true;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecideUpdate {
    pub analysis: String,
    pub payload: String,
    pub verdict: TaskVerdict,
    pub environment: Option<EnvironmentKind>,
}

impl DecideUpdate {
    pub fn apply(self, state: &mut RunState) {
        state.analysis = self.analysis;
        state.payload = self.payload;

        if let Some(kind) = self.environment.filter(|k| *k != EnvironmentKind::Unknown) {
            if kind != state.environment {
                info!(from = %state.environment, to = %kind, "environment classified");
                state.environment = kind;
            }
        }

        let Some(id) = state.current_task.clone() else {
            return;
        };
        state.phase.record_attempt(&id);
        match self.verdict {
            TaskVerdict::Continue => {}
            TaskVerdict::Completed { result } => {
                state.phase.complete_task(&id, result);
                state.flags.task_completed = true;
            }
            TaskVerdict::Stuck { reason, .. } => {
                state.phase.mark_stuck(&id);
                state.stuck_reason = Some(reason);
                state.flags.task_stuck = true;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActUpdate {
    Sent { entry: String },
    /// Empty payload; nothing sent and nothing recorded.
    Skipped,
    Failed,
}

impl ActUpdate {
    pub fn apply(self, state: &mut RunState) {
        match self {
            Self::Sent { entry } => state.push_history(entry),
            Self::Skipped => {}
            Self::Failed => state.flags.reconnect_requested = true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinUpdate {
    Applied(KnowledgeReport),
    /// No job, or the job failed; knowledge stays as it was.
    Unchanged,
}

impl JoinUpdate {
    pub fn apply(self, state: &mut RunState) {
        let Self::Applied(report) = self else {
            return;
        };
        if report.phase != state.phase.number {
            warn!(
                report_phase = report.phase,
                phase = state.phase.number,
                "discarding knowledge report for another phase"
            );
            return;
        }
        state.knowledge = report.knowledge;
        state.consolidation_counter = report.counter;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanUpdate {
    pub phase: Phase,
    /// Phases completed during this planning pass.
    pub archived: Vec<PhaseSummary>,
    pub current_task: Option<String>,
    /// A new phase started; its knowledge list begins empty.
    pub knowledge_reset: bool,
    pub exit_requested: bool,
}

impl PlanUpdate {
    pub fn apply(self, state: &mut RunState) {
        state.phase = self.phase;
        state.completed_phases.extend(self.archived);
        state.current_task = self.current_task;
        if self.knowledge_reset {
            state.knowledge.clear();
            state.consolidation_counter = 0;
        }
        state.flags.exit_requested = self.exit_requested;
        state.flags.task_completed = false;
        state.flags.task_stuck = false;
        state.stuck_reason = None;
    }
}
