//! Control-flow graph for one connection.
//!
//! ```text
//! Plan -> Observe -> DispatchConsolidation -> Decide -> Act -> JoinConsolidation
//!  ^         ^                                                       |
//!  |         +---------------- task still running -------------------+
//!  +-------------------------- completed or stuck -------------------+
//! ```
//!
//! The graph ends with `Exited` when planning finds nothing left to explore,
//! `Reconnect` when the connection is lost, and `Stopped` once the stop token
//! is cancelled (checked before every state).

use crate::connection::{clean, Connection, NoiseFilter, Received};
use crate::consolidation::ConsolidationWorker;
use crate::journal::SessionLog;
use crate::oracle::{CallPurpose, DecisionOracle, ModelTier};
use crate::planner::TaskPlanner;
use crate::state::{ActUpdate, DecideUpdate, JoinUpdate, ObserveUpdate, RunState};
use crate::watchdog::{CycleSignals, TaskVerdict, Watchdog};
use probe_core::decision::Decision;
use probe_core::events::{
    CommandSentPayload, EventPayload, KnowledgeUpdatedPayload, TaskCompletedPayload,
    TaskStuckPayload,
};
use probe_core::prompt::{self, DecisionContext};
use probe_core::tasks::truncate_chars;
use probe_core::{Config, KnowledgeStore};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Characters of server output kept in a history entry.
const HISTORY_OUTPUT_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("phase {phase} has no runnable task")]
    NoRunnableTask { phase: u32 },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Plan,
    Observe,
    DispatchConsolidation,
    Decide,
    Act,
    JoinConsolidation,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Observe => "observe",
            Self::DispatchConsolidation => "dispatch_consolidation",
            Self::Decide => "decide",
            Self::Act => "act",
            Self::JoinConsolidation => "join_consolidation",
        }
    }
}

/// How a graph run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphExit {
    Stopped,
    Exited,
    Reconnect,
}

impl GraphExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Reconnect => "reconnect",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub knowledge_prompt_limit: usize,
    pub act_pacing: Duration,
    pub join_timeout: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            knowledge_prompt_limit: config.knowledge_prompt_limit,
            act_pacing: Duration::from_millis(config.act_pacing_ms),
            join_timeout: Duration::from_secs(config.join_timeout_sec),
        }
    }
}

/// Everything one graph run borrows from the agent.
pub struct Scheduler<'a> {
    pub connection: &'a mut dyn Connection,
    pub oracle: &'a DecisionOracle,
    pub planner: &'a TaskPlanner,
    pub worker: &'a ConsolidationWorker,
    pub store: &'a KnowledgeStore,
    pub log: &'a SessionLog,
    pub noise: &'a NoiseFilter,
    pub watchdog: &'a Watchdog,
    pub stop: &'a CancellationToken,
    pub settings: SchedulerSettings,
}

impl std::fmt::Debug for Scheduler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Scheduler<'_> {
    pub async fn run(&mut self, state: &mut RunState) -> Result<GraphExit> {
        let mut step = Step::Plan;
        loop {
            if self.stop.is_cancelled() {
                state.flags.stop_requested = true;
                info!(step = step.as_str(), "stop requested");
                return Ok(GraphExit::Stopped);
            }
            debug!(step = step.as_str(), "entering state");

            step = match step {
                Step::Plan => {
                    self.planner.plan(state, self.log).await?.apply(state);
                    if state.flags.exit_requested {
                        return Ok(GraphExit::Exited);
                    }
                    Step::Observe
                }
                Step::Observe => {
                    self.observe(state).await;
                    if state.flags.reconnect_requested {
                        return Ok(GraphExit::Reconnect);
                    }
                    Step::DispatchConsolidation
                }
                Step::DispatchConsolidation => {
                    self.dispatch(state);
                    Step::Decide
                }
                Step::Decide => {
                    self.decide(state).await;
                    Step::Act
                }
                Step::Act => {
                    self.act(state).await;
                    if state.flags.reconnect_requested {
                        return Ok(GraphExit::Reconnect);
                    }
                    Step::JoinConsolidation
                }
                Step::JoinConsolidation => {
                    self.join(state).await;
                    if state.flags.task_completed || state.flags.task_stuck {
                        Step::Plan
                    } else {
                        Step::Observe
                    }
                }
            };
        }
    }

    async fn observe(&mut self, state: &mut RunState) {
        let update = match self.connection.receive().await {
            Received::Text(raw) => {
                let clean = clean(&raw, self.noise);
                if !clean.is_empty() {
                    info!(output = %clean, "server output");
                }
                ObserveUpdate::Received { raw, clean }
            }
            Received::Empty => ObserveUpdate::Received {
                raw: String::new(),
                clean: String::new(),
            },
            Received::Lost => {
                warn!("connection lost while reading");
                ObserveUpdate::Lost
            }
        };
        update.apply(state);
    }

    fn dispatch(&self, state: &mut RunState) {
        match self.worker.dispatch(state.knowledge_job()) {
            Ok(pending) => state.pending_consolidation = Some(pending),
            Err(err) => warn!(error = %err, "knowledge review not dispatched"),
        }
    }

    async fn decide(&self, state: &mut RunState) {
        let knowledge = self.store.aggregate(state.phase.number, &state.knowledge);
        let prompt = prompt::decision(&DecisionContext {
            phase: state.phase.number,
            phase_name: &state.phase.name,
            task: state.current(),
            knowledge: &knowledge,
            knowledge_limit: self.settings.knowledge_prompt_limit,
            history: &state.history,
            output: &state.clean_output,
        });
        let decision: Decision = self
            .oracle
            .call(&prompt, CallPurpose::Decision, ModelTier::Chat)
            .await;
        info!(analysis = %decision.analysis, payload = decision.payload(), "decision");

        let attempts = state.current().map_or(0, |t| t.attempts.saturating_add(1));
        let result = match decision.result() {
            r if r.is_empty() => decision.analysis.clone(),
            r => r,
        };
        let verdict = self.watchdog.evaluate(&CycleSignals {
            completed: decision.task_completed,
            result,
            reported_stuck: decision.task_stuck,
            stuck_reason: decision.stuck_reason().map(str::to_string),
            analysis: decision.analysis.clone(),
            attempts,
        });

        if let Some(task_id) = state.current_task.clone() {
            let phase = state.phase.number;
            match &verdict {
                TaskVerdict::Continue => {}
                TaskVerdict::Completed { result } => {
                    info!(phase, task_id = %task_id, result = %result, "task completed");
                    self.log
                        .record(EventPayload::TaskCompleted(TaskCompletedPayload {
                            phase,
                            task_id,
                            result: result.clone(),
                            attempts,
                        }))
                        .await;
                }
                TaskVerdict::Stuck { reason, .. } => {
                    self.log
                        .record(EventPayload::TaskStuck(TaskStuckPayload {
                            phase,
                            task_id,
                            reason: reason.clone(),
                        }))
                        .await;
                }
            }
        }

        DecideUpdate {
            analysis: decision.analysis.clone(),
            payload: decision.payload().to_string(),
            verdict,
            environment: decision.environment(),
        }
        .apply(state);
    }

    async fn act(&mut self, state: &mut RunState) {
        let payload = state.payload.clone();
        if payload.trim().is_empty() {
            debug!("no payload this cycle");
            ActUpdate::Skipped.apply(state);
        } else if self.connection.send(&payload).await {
            info!(payload = %payload, "sent");
            self.log
                .record(EventPayload::CommandSent(CommandSentPayload {
                    phase: state.phase.number,
                    task_id: state.current_task.clone(),
                    payload: payload.clone(),
                }))
                .await;
            let entry = format!(
                "In: {payload} | Out: {}...",
                truncate_chars(&state.clean_output, HISTORY_OUTPUT_CHARS)
            );
            ActUpdate::Sent { entry }.apply(state);
        } else {
            warn!(payload = %payload, "send failed");
            ActUpdate::Failed.apply(state);
            return;
        }
        tokio::time::sleep(self.settings.act_pacing).await;
    }

    async fn join(&self, state: &mut RunState) {
        let update = match state.pending_consolidation.take() {
            None => JoinUpdate::Unchanged,
            Some(pending) => match pending.join(self.settings.join_timeout).await {
                Ok(report) => {
                    if report.added > 0 || report.consolidated {
                        info!(
                            phase = report.phase,
                            added = report.added,
                            total = report.knowledge.len(),
                            consolidated = report.consolidated,
                            "knowledge updated"
                        );
                        self.log
                            .record(EventPayload::KnowledgeUpdated(KnowledgeUpdatedPayload {
                                phase: report.phase,
                                added: report.added,
                                total: report.knowledge.len(),
                                counter: report.counter,
                            }))
                            .await;
                    }
                    JoinUpdate::Applied(report)
                }
                Err(err) => {
                    warn!(error = %err, "knowledge review failed, keeping knowledge");
                    JoinUpdate::Unchanged
                }
            },
        };
        update.apply(state);
    }
}
