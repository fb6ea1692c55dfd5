//! probed - unattended text-service explorer
//!
//! Library components for the agent process: the connection and oracle
//! boundaries, the planner, the consolidation worker and the scheduler graph,
//! tied together by [`Agent`].

pub mod connection;
pub mod consolidation;
pub mod journal;
pub mod oracle;
pub mod planner;
pub mod scheduler;
pub mod state;
pub mod watchdog;

use std::sync::Arc;
use std::time::Duration;

use connection::{Connection, NoiseFilter};
use consolidation::{ConsolidationWorker, KnowledgeReviewer};
use journal::{Journal, SessionLog};
use oracle::{ChatBackend, DecisionOracle};
use planner::TaskPlanner;
use probe_core::events::{EventPayload, SessionEndedPayload, SessionStartedPayload};
use probe_core::{Config, EnvironmentKind, KnowledgeStore};
use scheduler::{GraphExit, Scheduler, SchedulerSettings};
use state::RunState;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use watchdog::{Watchdog, WatchdogConfig};

/// Time the consolidation lane gets to finish on shutdown.
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid noise pattern: {0}")]
    NoisePattern(#[from] regex::Error),
}

/// How the agent finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOutcome {
    /// Stop was requested.
    Stopped,
    /// Every task of the final phase is done in an environment there is
    /// nothing more to learn from.
    Exited(EnvironmentKind),
}

/// Owns the connection, the oracle and the worker, and runs the scheduler
/// graph once per connection until stopped or exited.
pub struct Agent {
    config: Config,
    connection: Box<dyn Connection>,
    oracle: DecisionOracle,
    store: KnowledgeStore,
    planner: TaskPlanner,
    worker: ConsolidationWorker,
    journal: Option<Journal>,
    noise: NoiseFilter,
    watchdog: Watchdog,
    stop: CancellationToken,
    state: RunState,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("target", &self.config.target())
            .field("phase", &self.state.phase.number)
            .field("oracle", &self.oracle)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Must be called inside a tokio runtime; the consolidation worker is
    /// spawned here.
    pub fn new(
        config: Config,
        connection: Box<dyn Connection>,
        backend: Arc<dyn ChatBackend>,
        journal: Option<Journal>,
        stop: CancellationToken,
    ) -> Result<Self, AgentError> {
        let noise = NoiseFilter::new(&config.noise_patterns)?;
        let oracle = DecisionOracle::new(backend, &config);
        let store = KnowledgeStore::new(config.knowledge_dir.clone());
        let planner = TaskPlanner::new(
            oracle.clone(),
            store.clone(),
            config.reselect_attempts,
            config.knowledge_prompt_limit,
        );
        let worker = ConsolidationWorker::spawn(KnowledgeReviewer::new(
            oracle.clone(),
            store.clone(),
            config.consolidation_interval,
        ));
        let watchdog = Watchdog::new(WatchdogConfig {
            max_attempts: config.max_task_attempts,
        });
        let state = RunState::new(config.max_history);

        Ok(Self {
            config,
            connection,
            oracle,
            store,
            planner,
            worker,
            journal,
            noise,
            watchdog,
            stop,
            state,
        })
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Connect, explore, and reconnect after every loss until stopped or
    /// exited. State carries over between connections.
    pub async fn run(&mut self) -> AgentOutcome {
        let delay = Duration::from_secs(self.config.reconnect_delay_sec);
        let target = self.config.target();
        info!(
            target = %target,
            phase = self.state.phase.number,
            max_attempts = self.watchdog.max_attempts(),
            "agent starting"
        );

        loop {
            if self.stop.is_cancelled() {
                return AgentOutcome::Stopped;
            }

            if !self.connection.connect().await {
                warn!(target = %target, delay_sec = delay.as_secs(), "connect failed, retrying");
                self.pause(delay).await;
                continue;
            }

            let log = SessionLog::new(self.journal.clone());
            let phase = self.state.phase.number;
            self.state.reset_for_reconnect(self.store.load(phase));
            info!(
                session = %log.session_id(),
                phase,
                knowledge = self.state.knowledge.len(),
                "session started"
            );
            log.record(EventPayload::SessionStarted(SessionStartedPayload {
                target: target.clone(),
                phase,
                phase_name: self.state.phase.name.clone(),
            }))
            .await;

            let mut scheduler = Scheduler {
                connection: self.connection.as_mut(),
                oracle: &self.oracle,
                planner: &self.planner,
                worker: &self.worker,
                store: &self.store,
                log: &log,
                noise: &self.noise,
                watchdog: &self.watchdog,
                stop: &self.stop,
                settings: SchedulerSettings::from_config(&self.config),
            };
            let result = scheduler.run(&mut self.state).await;
            self.connection.disconnect().await;

            let ended = match &result {
                Ok(exit) => exit.as_str(),
                Err(_) => "error",
            };
            log.record(EventPayload::SessionEnded(SessionEndedPayload {
                outcome: ended.to_string(),
                phase: self.state.phase.number,
            }))
            .await;

            match result {
                Ok(GraphExit::Stopped) => {
                    info!("stopped");
                    return AgentOutcome::Stopped;
                }
                Ok(GraphExit::Exited) => {
                    info!(environment = %self.state.environment, "exploration finished");
                    return AgentOutcome::Exited(self.state.environment);
                }
                Ok(GraphExit::Reconnect) => {
                    warn!(delay_sec = delay.as_secs(), "connection lost, reconnecting");
                }
                Err(err) => {
                    error!(error = %err, delay_sec = delay.as_secs(), "scheduler failed, restarting");
                }
            }
            self.pause(delay).await;
        }
    }

    /// Shut the consolidation lane down. Call once `run` has returned.
    pub async fn shutdown(&mut self) {
        self.connection.disconnect().await;
        self.worker.shutdown(WORKER_SHUTDOWN_GRACE).await;
    }

    /// Sleep, waking early on stop.
    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.stop.cancelled() => {}
        }
    }
}
