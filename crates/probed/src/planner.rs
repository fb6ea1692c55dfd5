//! Oracle-driven side of the task/phase manager.
//!
//! One planning pass, in order:
//! 1. give a phase without tasks its list (seed set for phase 1)
//! 2. resolve every stuck task
//! 3. roll over to a new phase, or request exit, once all tasks are done
//! 4. select the next task and draft its plan if it has none
//!
//! The pass works on a copy of the phase and hands the result back as a
//! [`PlanUpdate`].

use crate::journal::SessionLog;
use crate::oracle::{CallPurpose, DecisionOracle, ModelTier};
use crate::scheduler::{Result, SchedulerError};
use crate::state::{PlanUpdate, RunState};
use probe_core::decision::{ExecutionPlan, PhaseName, PhasePlan, StuckVerdict};
use probe_core::events::{
    EventPayload, PhaseCompletedPayload, PhaseStartedPayload, StuckResolvedPayload,
    TaskAssignedPayload,
};
use probe_core::tasks::{seed_tasks, StuckAction, StuckResolution};
use probe_core::{
    prompt, KnowledgeEntry, KnowledgeStore, Phase, PhaseStatus, PhaseSummary, ReselectPolicy,
};
use tracing::{info, warn};

/// Stand-in reason for a task found stuck without a recorded one.
const UNRECORDED_STUCK_REASON: &str = "task was left stuck without a recorded reason";

#[derive(Debug, Clone)]
pub struct TaskPlanner {
    oracle: DecisionOracle,
    store: KnowledgeStore,
    policy: ReselectPolicy,
    knowledge_limit: usize,
}

impl TaskPlanner {
    pub fn new(
        oracle: DecisionOracle,
        store: KnowledgeStore,
        policy: ReselectPolicy,
        knowledge_limit: usize,
    ) -> Self {
        Self {
            oracle,
            store,
            policy,
            knowledge_limit,
        }
    }

    pub async fn plan(&self, state: &RunState, log: &SessionLog) -> Result<PlanUpdate> {
        let mut phase = state.phase.clone();
        let mut current_task = state.current_task.clone();
        let mut archived: Vec<PhaseSummary> = Vec::new();
        let mut knowledge_reset = false;

        if phase.tasks.is_empty() {
            phase.tasks = if phase.number == 1 {
                seed_tasks()
            } else {
                let knowledge = self.store.aggregate(phase.number, &state.knowledge);
                self.generate_tasks(phase.number, &state.completed_phases, &knowledge, state)
                    .await
            };
            announce_phase(&phase, log).await;
        }

        for id in phase.stuck_task_ids() {
            let reason = match (&current_task, &state.stuck_reason) {
                (Some(current), Some(reason)) if *current == id => reason.clone(),
                _ => UNRECORDED_STUCK_REASON.to_string(),
            };
            self.resolve_stuck(&mut phase, &id, &reason, &state.knowledge, log)
                .await;
            if current_task.as_deref() == Some(id.as_str()) {
                current_task = None;
            }
        }

        if current_task
            .as_deref()
            .and_then(|id| phase.task(id))
            .is_some_and(|t| t.status.is_terminal())
        {
            current_task = None;
        }

        if phase.is_complete() {
            phase.status = PhaseStatus::Completed;
            let summary = phase.summarize();
            info!(
                phase = phase.number,
                name = %phase.name,
                findings = %summary.key_findings,
                "phase complete"
            );
            log.record(EventPayload::PhaseCompleted(PhaseCompletedPayload {
                phase: phase.number,
                name: phase.name.clone(),
                key_findings: summary.key_findings.clone(),
                environment: state.environment,
            }))
            .await;

            if state.environment.is_terminal() {
                info!(
                    environment = %state.environment,
                    "environment is not text based, nothing left to explore"
                );
                return Ok(PlanUpdate {
                    phase,
                    archived,
                    current_task: None,
                    knowledge_reset,
                    exit_requested: true,
                });
            }

            let knowledge = self.store.aggregate(phase.number, &state.knowledge);
            let number = phase.number + 1;
            archived.push(summary);
            let summaries: Vec<PhaseSummary> = state
                .completed_phases
                .iter()
                .chain(archived.iter())
                .cloned()
                .collect();

            let name: PhaseName = self
                .oracle
                .call(
                    &prompt::phase_name(number, &summaries, state.environment),
                    CallPurpose::PhaseName,
                    ModelTier::Reasoner,
                )
                .await;
            let tasks = self
                .generate_tasks(number, &summaries, &knowledge, state)
                .await;
            phase = Phase::new(number, name.phase_name.trim(), tasks);
            knowledge_reset = true;
            announce_phase(&phase, log).await;
        }

        let Some(selection) = phase.select_next(self.policy) else {
            return Err(SchedulerError::NoRunnableTask {
                phase: phase.number,
            });
        };

        let live: &[KnowledgeEntry] = if knowledge_reset {
            &[]
        } else {
            &state.knowledge
        };
        let knowledge = self.store.aggregate(phase.number, live);
        let task = &phase.tasks[selection.index];
        let plan = match &task.plan {
            Some(plan) => plan.clone(),
            None => {
                let drafted: ExecutionPlan = self
                    .oracle
                    .call(
                        &prompt::execution_plan(
                            phase.number,
                            &phase.name,
                            task,
                            &knowledge,
                            self.knowledge_limit,
                        ),
                        CallPurpose::ExecutionPlan,
                        ModelTier::Reasoner,
                    )
                    .await;
                drafted.plan.trim().to_string()
            }
        };
        let task = &mut phase.tasks[selection.index];
        task.plan = Some(plan);

        info!(
            phase = phase.number,
            task_id = %task.id,
            resumed = selection.resumed,
            attempts = task.attempts,
            description = %task.description,
            "task assigned"
        );
        log.record(EventPayload::TaskAssigned(TaskAssignedPayload {
            phase: phase.number,
            task_id: task.id.clone(),
            description: task.description.clone(),
            resumed: selection.resumed,
            plan: task.plan.clone(),
        }))
        .await;

        Ok(PlanUpdate {
            current_task: Some(task.id.clone()),
            phase,
            archived,
            knowledge_reset,
            exit_requested: false,
        })
    }

    async fn generate_tasks(
        &self,
        number: u32,
        summaries: &[PhaseSummary],
        knowledge: &[KnowledgeEntry],
        state: &RunState,
    ) -> Vec<probe_core::Task> {
        let plan: PhasePlan = self
            .oracle
            .call(
                &prompt::phase_tasks(
                    number,
                    summaries,
                    knowledge,
                    self.knowledge_limit,
                    state.environment,
                ),
                CallPurpose::PhaseTasks,
                ModelTier::Reasoner,
            )
            .await;
        if let Some(gaps) = plan.gap_analysis.as_deref() {
            info!(phase = number, gaps, "phase gap analysis");
        }
        plan.into_tasks(number)
    }

    async fn resolve_stuck(
        &self,
        phase: &mut Phase,
        id: &str,
        reason: &str,
        live: &[KnowledgeEntry],
        log: &SessionLog,
    ) {
        let Some(task) = phase.task(id) else {
            return;
        };
        let knowledge = self.store.aggregate(phase.number, live);
        let prompt = prompt::stuck_verdict(phase.number, task, reason, &knowledge);
        let verdict: StuckVerdict = self
            .oracle
            .call(&prompt, CallPurpose::StuckVerdict, ModelTier::Reasoner)
            .await;

        // the validator only accepts recognised actions
        let resolution = verdict.resolution(reason).unwrap_or_else(|| StuckResolution {
            action: StuckAction::Skip,
            summary: reason.to_string(),
            new_description: None,
        });
        if !phase.apply_resolution(id, &resolution) {
            warn!(phase = phase.number, task_id = id, "stuck task vanished");
            return;
        }

        let status = phase.task(id).map(|t| t.status).unwrap_or_default();
        info!(
            phase = phase.number,
            task_id = id,
            action = resolution.action.as_str(),
            status = status.as_str(),
            reasoning = verdict.reasoning.as_deref().unwrap_or_default(),
            "stuck task resolved"
        );
        log.record(EventPayload::StuckResolved(StuckResolvedPayload {
            phase: phase.number,
            task_id: id.to_string(),
            action: resolution.action.as_str().to_string(),
            status,
        }))
        .await;
    }
}

async fn announce_phase(phase: &Phase, log: &SessionLog) {
    let task_ids: Vec<String> = phase.tasks.iter().map(|t| t.id.clone()).collect();
    info!(phase = phase.number, name = %phase.name, tasks = ?task_ids, "phase started");
    log.record(EventPayload::PhaseStarted(PhaseStartedPayload {
        phase: phase.number,
        name: phase.name.clone(),
        task_ids,
    }))
    .await;
}
