//! End-to-end scenarios for the agent loop.
//!
//! The agent runs against a scripted connection and a scripted oracle. When
//! the connection runs out of scripted reads it cancels the stop token, so
//! every scenario ends with the graph returning at its next state boundary.

use async_trait::async_trait;
use probe_core::{Config, EnvironmentKind, KnowledgeStore, PhaseStatus, TaskStatus};
use probed::connection::{Connection, Received};
use probed::journal::Journal;
use probed::oracle::{CallPurpose, ChatBackend, ChatRequest, OracleError};
use probed::{Agent, AgentOutcome};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// --- Scripted connection ---

#[derive(Default)]
struct Wire {
    /// Results of successive connect attempts; succeeds once exhausted.
    connect_results: VecDeque<bool>,
    connects: Vec<Instant>,
    reads: VecDeque<Received>,
    lost_at: Option<Instant>,
    /// Number of upcoming sends that fail.
    failing_sends: usize,
    sent: Vec<String>,
}

struct ScriptedConnection {
    wire: Arc<Mutex<Wire>>,
    stop: CancellationToken,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn connect(&mut self) -> bool {
        let mut wire = self.wire.lock().unwrap();
        wire.connects.push(Instant::now());
        wire.connect_results.pop_front().unwrap_or(true)
    }

    async fn send(&mut self, text: &str) -> bool {
        let mut wire = self.wire.lock().unwrap();
        if wire.failing_sends > 0 {
            wire.failing_sends -= 1;
            return false;
        }
        wire.sent.push(text.to_string());
        true
    }

    async fn receive(&mut self) -> Received {
        let mut wire = self.wire.lock().unwrap();
        match wire.reads.pop_front() {
            Some(Received::Lost) => {
                wire.lost_at = Some(Instant::now());
                Received::Lost
            }
            Some(read) => read,
            None => {
                self.stop.cancel();
                Received::Empty
            }
        }
    }

    async fn disconnect(&mut self) {}
}

// --- Scripted oracle ---

/// Replies by call purpose: scripted replies first, then the fallback.
struct ScriptedOracle {
    scripts: Mutex<HashMap<CallPurpose, VecDeque<Value>>>,
    fallbacks: HashMap<CallPurpose, Value>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedOracle {
    fn new() -> Self {
        let fallbacks = HashMap::from([
            (
                CallPurpose::Decision,
                json!({"analysis": "nothing new", "next_payload": ""}),
            ),
            (CallPurpose::ExecutionPlan, json!({"plan": "read the output"})),
            (CallPurpose::KnowledgeReview, json!({"new_entries": []})),
            (CallPurpose::Consolidation, json!({"consolidated_entries": []})),
            (CallPurpose::PhaseName, json!({"phase_name": "Command discovery"})),
            (
                CallPurpose::PhaseTasks,
                json!({"tasks": [{"id": "P2-T1", "description": "find the help command"}]}),
            ),
            (
                CallPurpose::StuckVerdict,
                json!({"action": "skip", "result_summary": "not reachable"}),
            ),
        ]);
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallbacks,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn script(self, purpose: CallPurpose, replies: Vec<Value>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(purpose, replies.into());
        self
    }

    fn calls(&self, purpose: CallPurpose) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.purpose == purpose)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChatBackend for ScriptedOracle {
    async fn complete(&self, request: &ChatRequest) -> Result<Value, OracleError> {
        self.requests.lock().unwrap().push(request.clone());
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.purpose)
            .and_then(VecDeque::pop_front);
        scripted
            .or_else(|| self.fallbacks.get(&request.purpose).cloned())
            .ok_or_else(|| OracleError::InvalidResponse("no scripted reply".into()))
    }
}

// --- Harness ---

struct Harness {
    _dir: TempDir,
    config: Config,
    wire: Arc<Mutex<Wire>>,
    oracle: Arc<ScriptedOracle>,
    agent: Agent,
}

fn test_config(dir: &TempDir) -> Config {
    Config {
        knowledge_dir: dir.path().join("knowledge_bases"),
        journal_enabled: false,
        ..Config::default()
    }
}

fn create_harness(
    config: Config,
    dir: TempDir,
    wire: Wire,
    oracle: ScriptedOracle,
    journal: Option<Journal>,
) -> Harness {
    let stop = CancellationToken::new();
    let wire = Arc::new(Mutex::new(wire));
    let oracle = Arc::new(oracle);
    let connection = Box::new(ScriptedConnection {
        wire: Arc::clone(&wire),
        stop: stop.clone(),
    });
    let backend: Arc<dyn ChatBackend> = Arc::clone(&oracle) as Arc<dyn ChatBackend>;
    let agent = Agent::new(config.clone(), connection, backend, journal, stop).unwrap();
    Harness {
        _dir: dir,
        config,
        wire,
        oracle,
        agent,
    }
}

fn reads(texts: &[&str]) -> VecDeque<Received> {
    texts.iter().map(|t| Received::Text((*t).to_string())).collect()
}

fn decision(payload: &str) -> Value {
    json!({"analysis": "exploring", "next_payload": payload})
}

// --- Scenarios ---

#[tokio::test(start_paused = true)]
async fn first_output_identifies_text_environment() {
    let dir = TempDir::new().unwrap();
    let oracle = ScriptedOracle::new().script(
        CallPurpose::Decision,
        vec![json!({
            "analysis": "readable banner with a prompt",
            "next_payload": "look",
            "task_completed": true,
            "task_result": "text based",
            "environment_type": "mud"
        })],
    );
    let wire = Wire {
        reads: reads(&["\x1b[1mWelcome to the realm\x1b[0m\n> "]),
        ..Wire::default()
    };
    let mut h = create_harness(test_config(&dir), dir, wire, oracle, None);

    assert_eq!(h.agent.run().await, AgentOutcome::Stopped);

    let state = h.agent.state();
    assert_eq!(state.environment, EnvironmentKind::Mud);
    assert_eq!(state.phase.number, 1);
    let first = state.phase.task("P1-T1").unwrap();
    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(first.result.as_deref(), Some("text based"));
    assert_eq!(first.attempts, 0);
    assert_eq!(state.current_task.as_deref(), Some("P1-T2"));
    assert_eq!(state.phase.in_progress_count(), 1);

    assert_eq!(h.wire.lock().unwrap().sent, vec!["look"]);
    assert_eq!(
        state.history,
        vec!["In: look | Out: Welcome to the realm\n>...".to_string()]
    );
    assert_eq!(h.oracle.calls(CallPurpose::ExecutionPlan).len(), 2);
    h.agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lost_read_reconnects_after_delay_and_resumes_task() {
    let dir = TempDir::new().unwrap();
    let oracle = ScriptedOracle::new().script(CallPurpose::Decision, vec![decision("look")]);
    let mut wire = Wire {
        reads: reads(&["A dusty room."]),
        ..Wire::default()
    };
    wire.reads.push_back(Received::Lost);
    let mut h = create_harness(test_config(&dir), dir, wire, oracle, None);

    assert_eq!(h.agent.run().await, AgentOutcome::Stopped);

    {
        let wire = h.wire.lock().unwrap();
        assert_eq!(wire.connects.len(), 2);
        let lost_at = wire.lost_at.unwrap();
        assert!(wire.connects[1] - lost_at >= Duration::from_secs(5));
        assert!(wire.connects[1] - lost_at < Duration::from_secs(6));
    }

    let state = h.agent.state();
    assert_eq!(state.phase.number, 1);
    assert_eq!(state.current_task.as_deref(), Some("P1-T1"));
    let task = state.phase.task("P1-T1").unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.attempts, 1);
    assert_eq!(state.phase.task("P1-T2").unwrap().status, TaskStatus::Pending);
    // the resumed task kept its plan
    assert_eq!(h.oracle.calls(CallPurpose::ExecutionPlan).len(), 1);
    assert_eq!(h.oracle.calls(CallPurpose::Decision).len(), 1);
    h.agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_connect_is_retried_after_delay() {
    let dir = TempDir::new().unwrap();
    let wire = Wire {
        connect_results: VecDeque::from([false, false]),
        ..Wire::default()
    };
    let mut h = create_harness(test_config(&dir), dir, wire, ScriptedOracle::new(), None);

    assert_eq!(h.agent.run().await, AgentOutcome::Stopped);

    let wire = h.wire.lock().unwrap();
    assert_eq!(wire.connects.len(), 3);
    assert_eq!(wire.connects[1] - wire.connects[0], Duration::from_secs(5));
    assert_eq!(wire.connects[2] - wire.connects[1], Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn attempt_ceiling_marks_task_stuck() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        max_task_attempts: 3,
        ..test_config(&dir)
    };
    let wire = Wire {
        reads: reads(&["prompt>", "prompt>", "prompt>"]),
        ..Wire::default()
    };
    let mut h = create_harness(config, dir, wire, ScriptedOracle::new(), None);

    assert_eq!(h.agent.run().await, AgentOutcome::Stopped);

    let verdicts = h.oracle.calls(CallPurpose::StuckVerdict);
    assert_eq!(verdicts.len(), 1);
    assert!(verdicts[0].system.contains("attempt ceiling exceeded"));
    assert_eq!(verdicts[0].model, h.config.oracle_reasoner_model);

    let state = h.agent.state();
    let stuck = state.phase.task("P1-T1").unwrap();
    assert_eq!(stuck.status, TaskStatus::Skipped);
    assert_eq!(stuck.result.as_deref(), Some("(skipped) not reachable"));
    assert_eq!(stuck.attempts, 0);
    assert_eq!(state.current_task.as_deref(), Some("P1-T2"));
    assert_eq!(state.phase.in_progress_count(), 1);
    assert!(h.wire.lock().unwrap().sent.is_empty());
    h.agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn task_stuck_before_reconnect_is_resolved_with_its_reason() {
    let dir = TempDir::new().unwrap();
    let oracle = ScriptedOracle::new()
        .script(
            CallPurpose::Decision,
            vec![json!({
                "analysis": "no echo at all",
                "next_payload": "help",
                "task_stuck": true,
                "stuck_reason": "server never echoes input"
            })],
        )
        .script(
            CallPurpose::StuckVerdict,
            vec![json!({
                "action": "pending",
                "new_description": "send a bare newline and watch for a prompt"
            })],
        );
    let wire = Wire {
        reads: reads(&["..."]),
        failing_sends: 1,
        ..Wire::default()
    };
    let mut h = create_harness(test_config(&dir), dir, wire, oracle, None);

    assert_eq!(h.agent.run().await, AgentOutcome::Stopped);

    let verdicts = h.oracle.calls(CallPurpose::StuckVerdict);
    assert_eq!(verdicts.len(), 1);
    assert!(verdicts[0].system.contains("server never echoes input"));

    let state = h.agent.state();
    let task = state.phase.task("P1-T1").unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.description, "send a bare newline and watch for a prompt");
    assert_eq!(state.current_task.as_deref(), Some("P1-T1"));
    assert_eq!(h.wire.lock().unwrap().connects.len(), 2);
    h.agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn review_in_flight_at_send_failure_is_not_joined_after_reconnect() {
    let dir = TempDir::new().unwrap();
    let oracle = ScriptedOracle::new()
        .script(CallPurpose::Decision, vec![decision("look")])
        .script(
            CallPurpose::KnowledgeReview,
            vec![json!({"new_entries": [{"content": "banner names the realm", "category": "spontaneous"}]})],
        );
    let wire = Wire {
        reads: reads(&["Welcome to the realm"]),
        failing_sends: 1,
        ..Wire::default()
    };
    let mut h = create_harness(test_config(&dir), dir, wire, oracle, None);

    assert_eq!(h.agent.run().await, AgentOutcome::Stopped);
    assert_eq!(h.wire.lock().unwrap().connects.len(), 2);
    assert_eq!(h.oracle.calls(CallPurpose::KnowledgeReview).len(), 1);

    let state = h.agent.state();
    assert!(state.pending_consolidation.is_none());
    // the stale report carried counter 1; only a join would have applied it
    assert_eq!(state.consolidation_counter, 0);
    // knowledge comes from the reload, not from the dropped report
    let stored = KnowledgeStore::new(h.config.knowledge_dir.clone()).load(1);
    assert_eq!(state.knowledge, stored);
    h.agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn consolidation_rewrites_knowledge_at_interval() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        consolidation_interval: 2,
        ..test_config(&dir)
    };
    let oracle = ScriptedOracle::new()
        .script(
            CallPurpose::KnowledgeReview,
            vec![
                json!({"new_entries": [{"content": "exits are listed", "category": "spontaneous"}]}),
                json!({"new_entries": [
                    {"content": "look shows the room", "category": "input_triggered"},
                    {"content": "exits are listed", "category": "spontaneous"}
                ]}),
            ],
        )
        .script(
            CallPurpose::Consolidation,
            vec![json!({"consolidated_entries": [
                {"content": "look shows the room and its exits", "category": "input_triggered"}
            ]})],
        );
    let wire = Wire {
        reads: reads(&["Exits: north", "A dusty room. Exits: north"]),
        ..Wire::default()
    };
    let mut h = create_harness(config, dir, wire, oracle, None);

    assert_eq!(h.agent.run().await, AgentOutcome::Stopped);

    let state = h.agent.state();
    assert_eq!(state.consolidation_counter, 0);
    assert_eq!(state.knowledge.len(), 1);
    assert_eq!(state.knowledge[0].content, "look shows the room and its exits");

    let stored = KnowledgeStore::new(h.config.knowledge_dir.clone()).load(1);
    assert_eq!(stored, state.knowledge);
    assert_eq!(h.oracle.calls(CallPurpose::Consolidation).len(), 1);
    h.agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn empty_consolidation_keeps_knowledge() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        consolidation_interval: 1,
        ..test_config(&dir)
    };
    let oracle = ScriptedOracle::new().script(
        CallPurpose::KnowledgeReview,
        vec![json!({"new_entries": [{"content": "banner is ascii art", "category": "spontaneous"}]})],
    );
    let wire = Wire {
        reads: reads(&["~~ banner ~~"]),
        ..Wire::default()
    };
    let mut h = create_harness(config, dir, wire, oracle, None);

    assert_eq!(h.agent.run().await, AgentOutcome::Stopped);

    let state = h.agent.state();
    assert_eq!(state.consolidation_counter, 0);
    assert_eq!(state.knowledge.len(), 1);
    assert_eq!(state.knowledge[0].content, "banner is ascii art");
    h.agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn non_text_environment_exits_after_phase_two() {
    let dir = TempDir::new().unwrap();
    let done = |env: &str| {
        json!({
            "analysis": "done",
            "next_payload": "",
            "task_completed": true,
            "task_result": "ok",
            "environment_type": env
        })
    };
    let oracle = ScriptedOracle::new().script(
        CallPurpose::Decision,
        vec![done("mud"), done("mud"), done("non_text")],
    );
    let wire = Wire {
        reads: reads(&["hello", "hello", "\u{fffd}\u{fffd}"]),
        ..Wire::default()
    };
    let mut h = create_harness(test_config(&dir), dir, wire, oracle, None);

    assert_eq!(
        h.agent.run().await,
        AgentOutcome::Exited(EnvironmentKind::NonText)
    );

    let state = h.agent.state();
    assert_eq!(state.phase.number, 2);
    assert_eq!(state.phase.name, "Command discovery");
    assert!(state.phase.is_complete());
    assert_eq!(state.phase.status, PhaseStatus::Completed);
    assert_eq!(state.completed_phases.len(), 1);
    assert_eq!(state.completed_phases[0].number, 1);
    assert_eq!(h.oracle.calls(CallPurpose::PhaseName).len(), 1);
    assert_eq!(h.oracle.calls(CallPurpose::PhaseTasks).len(), 1);
    // the stop token was never needed
    assert!(!h.agent.stop_token().is_cancelled());
    h.agent.shutdown().await;
}

#[tokio::test]
async fn session_is_journaled() {
    let dir = TempDir::new().unwrap();
    let journal = Journal::open(&dir.path().join("journal.db")).await.unwrap();
    let config = Config {
        journal_enabled: true,
        act_pacing_ms: 0,
        ..test_config(&dir)
    };
    let oracle = ScriptedOracle::new().script(
        CallPurpose::Decision,
        vec![json!({
            "analysis": "text",
            "next_payload": "look",
            "task_completed": true,
            "task_result": "text based"
        })],
    );
    let wire = Wire {
        reads: reads(&["login:"]),
        ..Wire::default()
    };
    let mut h = create_harness(config, dir, wire, oracle, Some(journal.clone()));

    assert_eq!(h.agent.run().await, AgentOutcome::Stopped);
    h.agent.shutdown().await;

    let sessions = journal.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    let events = journal.list_events(&sessions[0]).await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "SESSION_STARTED",
            "PHASE_STARTED",
            "TASK_ASSIGNED",
            "TASK_COMPLETED",
            "COMMAND_SENT",
            "TASK_ASSIGNED",
            "SESSION_ENDED",
        ]
    );
    assert!(events.last().unwrap().payload_json.contains("\"stopped\""));
}
