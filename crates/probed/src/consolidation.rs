//! Background knowledge consolidation.
//!
//! A single worker lane reviews recent interaction against the phase's task
//! list, appends new facts and periodically has the oracle rewrite the whole
//! list. Jobs carry snapshots by value; results come back through a oneshot
//! that the scheduler joins after acting.

use crate::oracle::{CallPurpose, DecisionOracle, ModelTier};
use probe_core::decision::{ConsolidatedKnowledge, FactProposal};
use probe_core::knowledge::merge_new;
use probe_core::prompt::{self, ReviewContext};
use probe_core::{KnowledgeEntry, KnowledgeStore, Task};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("a consolidation job is already queued")]
    Busy,
    #[error("consolidation worker is shut down")]
    Closed,
    #[error("consolidation job failed: {0}")]
    Failed(String),
    #[error("consolidation job did not finish within {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Everything a review needs, copied out of the run state.
#[derive(Debug, Clone)]
pub struct KnowledgeJob {
    pub phase: u32,
    pub phase_name: String,
    pub history: Vec<String>,
    pub knowledge: Vec<KnowledgeEntry>,
    pub tasks: Vec<Task>,
    pub counter: u32,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeReport {
    pub phase: u32,
    pub knowledge: Vec<KnowledgeEntry>,
    pub counter: u32,
    pub added: usize,
    /// The list was rewritten this cycle.
    pub consolidated: bool,
}

impl KnowledgeReport {
    fn unchanged(job: KnowledgeJob) -> Self {
        Self {
            phase: job.phase,
            knowledge: job.knowledge,
            counter: job.counter,
            added: 0,
            consolidated: false,
        }
    }
}

/// Performs one review. Cloned into every job task.
#[derive(Debug, Clone)]
pub struct KnowledgeReviewer {
    oracle: DecisionOracle,
    store: KnowledgeStore,
    /// Review cycles between full rewrites.
    interval: u32,
}

impl KnowledgeReviewer {
    pub fn new(oracle: DecisionOracle, store: KnowledgeStore, interval: u32) -> Self {
        Self {
            oracle,
            store,
            interval,
        }
    }

    pub async fn review(&self, job: KnowledgeJob) -> KnowledgeReport {
        if job.history.is_empty() && job.tasks.is_empty() {
            debug!(phase = job.phase, "nothing to review");
            return KnowledgeReport::unchanged(job);
        }

        let phase = job.phase;
        let previous = self.store.load_previous(phase);
        let review = prompt::knowledge_review(&ReviewContext {
            phase,
            phase_name: &job.phase_name,
            tasks: &job.tasks,
            previous: &previous,
            current: &job.knowledge,
            history: &job.history,
            output: &job.output,
        });
        let proposal: FactProposal = self
            .oracle
            .call(&review, CallPurpose::KnowledgeReview, ModelTier::Chat)
            .await;
        if let Some(focus) = proposal.kb_focus.as_deref() {
            debug!(phase, focus, "knowledge focus");
        }

        let mut knowledge = job.knowledge;
        let before = knowledge.len();
        let added = merge_new(&mut knowledge, proposal.into_entries(phase));
        for entry in &knowledge[before..] {
            info!(phase, category = %entry.category, content = %entry.content, "new knowledge");
        }
        let mut counter = job.counter.saturating_add(1);

        if added > 0 {
            self.persist(phase, &knowledge);
        }

        let mut consolidated = false;
        if counter >= self.interval {
            info!(phase, entries = knowledge.len(), "consolidating knowledge");
            if !knowledge.is_empty() {
                let rewrite = prompt::consolidation(phase, &job.phase_name, &knowledge);
                let reply: ConsolidatedKnowledge = self
                    .oracle
                    .call(&rewrite, CallPurpose::Consolidation, ModelTier::Chat)
                    .await;
                let entries = reply.into_entries(phase);
                if entries.is_empty() {
                    warn!(phase, "consolidation produced no valid entries, keeping list");
                } else {
                    info!(phase, before = knowledge.len(), after = entries.len(), "knowledge consolidated");
                    knowledge = entries;
                    consolidated = true;
                }
            }
            self.persist(phase, &knowledge);
            counter = 0;
        }

        KnowledgeReport {
            phase,
            knowledge,
            counter,
            added,
            consolidated,
        }
    }

    fn persist(&self, phase: u32, knowledge: &[KnowledgeEntry]) {
        if let Err(err) = self.store.save(phase, knowledge) {
            warn!(phase, error = %err, "failed to persist knowledge");
        }
    }
}

struct Envelope {
    job: KnowledgeJob,
    reply: oneshot::Sender<Result<KnowledgeReport>>,
}

/// Handle to a dispatched job.
#[derive(Debug)]
pub struct PendingConsolidation {
    phase: u32,
    rx: oneshot::Receiver<Result<KnowledgeReport>>,
}

impl PendingConsolidation {
    pub(crate) fn new(phase: u32, rx: oneshot::Receiver<Result<KnowledgeReport>>) -> Self {
        Self { phase, rx }
    }

    pub fn phase(&self) -> u32 {
        self.phase
    }

    /// Wait for the job's report. Failure, timeout and a vanished worker all
    /// come back as errors for the caller to log and ignore.
    pub async fn join(self, timeout: Duration) -> Result<KnowledgeReport> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkerError::Failed("worker dropped the job".to_string())),
            Err(_) => Err(WorkerError::Timeout(timeout)),
        }
    }
}

/// Single-lane worker with a queue of depth one.
#[derive(Debug)]
pub struct ConsolidationWorker {
    tx: Option<mpsc::Sender<Envelope>>,
    handle: Option<JoinHandle<()>>,
}

impl ConsolidationWorker {
    pub fn spawn(reviewer: KnowledgeReviewer) -> Self {
        let (tx, mut rx) = mpsc::channel::<Envelope>(1);
        let handle = tokio::spawn(async move {
            while let Some(Envelope { job, reply }) = rx.recv().await {
                let phase = job.phase;
                let reviewer = reviewer.clone();
                // own task so a panic in one job cannot take the lane down
                let outcome = tokio::spawn(async move { reviewer.review(job).await }).await;
                let result = outcome.map_err(|err| {
                    warn!(phase, error = %err, "consolidation job panicked");
                    WorkerError::Failed(err.to_string())
                });
                if reply.send(result).is_err() {
                    debug!(phase, "consolidation result discarded, nobody waiting");
                }
            }
            debug!("consolidation worker stopped");
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queue a job without waiting for it.
    pub fn dispatch(&self, job: KnowledgeJob) -> Result<PendingConsolidation> {
        let tx = self.tx.as_ref().ok_or(WorkerError::Closed)?;
        let phase = job.phase;
        let (reply, rx) = oneshot::channel();
        tx.try_send(Envelope { job, reply }).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => WorkerError::Busy,
            mpsc::error::TrySendError::Closed(_) => WorkerError::Closed,
        })?;
        Ok(PendingConsolidation::new(phase, rx))
    }

    /// Stop accepting jobs and give the lane `grace` to drain before it is
    /// aborted. A job can sit in oracle retries indefinitely.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.tx.take();
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "consolidation worker ended abnormally"),
            Err(_) => {
                warn!(?grace, "consolidation worker still busy, aborting");
                handle.abort();
            }
        }
    }
}
