//! Prompt assembly for oracle calls.
//!
//! Each builder returns the system/user pair for one call purpose and names
//! the JSON keys the matching record in [`crate::decision`] expects.

use crate::types::{EnvironmentKind, KnowledgeEntry, PhaseSummary, Task};
use std::fmt::Write as _;

/// Shown instead of an empty knowledge list.
const NO_KNOWLEDGE: &str = "None yet.";

/// Prior-phase entries shown to the fact reviewer.
const REVIEW_PREVIOUS_LIMIT: usize = 15;

/// Stuck handling sees a shorter knowledge tail than planning.
const STUCK_KNOWLEDGE_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OraclePrompt {
    pub system: String,
    pub user: String,
}

/// Render the last `limit` entries as a bullet list.
///
/// With `tag_phase` each line also carries the entry's origin phase.
pub fn format_knowledge(entries: &[KnowledgeEntry], limit: usize, tag_phase: bool) -> String {
    if entries.is_empty() {
        return NO_KNOWLEDGE.to_string();
    }
    let start = entries.len().saturating_sub(limit);
    let mut out = String::new();
    for entry in &entries[start..] {
        if tag_phase {
            let _ = writeln!(
                out,
                "- [phase {}][{}] {}",
                entry.origin_phase, entry.category, entry.content
            );
        } else {
            let _ = writeln!(out, "- [{}] {}", entry.category, entry.content);
        }
    }
    out
}

fn format_summaries(summaries: &[PhaseSummary]) -> String {
    if summaries.is_empty() {
        return "None (this is the first phase being planned).".to_string();
    }
    let mut out = String::new();
    for summary in summaries {
        let _ = writeln!(out, "\n### Phase {}: {}", summary.number, summary.name);
        for outcome in &summary.outcomes {
            let _ = writeln!(
                out,
                "- [{}] {}: {}",
                outcome.id,
                outcome.description,
                outcome.result.as_deref().unwrap_or("none")
            );
        }
        let _ = writeln!(out, "Key findings: {}", summary.key_findings);
    }
    out
}

fn format_history(history: &[String], numbered: bool) -> String {
    if history.is_empty() {
        return "(no interaction yet)".to_string();
    }
    if numbered {
        history
            .iter()
            .enumerate()
            .map(|(i, h)| format!("{}. {h}", i + 1))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        history.join("\n")
    }
}

/// Inputs for the per-cycle decision.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub phase: u32,
    pub phase_name: &'a str,
    pub task: Option<&'a Task>,
    pub knowledge: &'a [KnowledgeEntry],
    pub knowledge_limit: usize,
    pub history: &'a [String],
    pub output: &'a str,
}

pub fn decision(ctx: &DecisionContext<'_>) -> OraclePrompt {
    let (task_id, task_desc, task_plan) = match ctx.task {
        Some(task) => (
            task.id.as_str(),
            task.description.as_str(),
            task.plan.as_deref().unwrap_or("no specific plan"),
        ),
        None => ("?", "no specific task", "no specific plan"),
    };
    let knowledge = format_knowledge(ctx.knowledge, ctx.knowledge_limit, true);
    let history = format_history(ctx.history, false);

    let system = format!(
        r#"You are an autonomous agent talking to a remote server over a raw socket.

Current phase: {phase} - {phase_name}
Current task [{task_id}]: {task_desc}
Execution plan: {task_plan}

Knowledge so far:
{knowledge}

Interaction history (client -> server):
{history}

The server's last output was: "{output}"

Your job:
1. Analyse the response and how it relates to the current task. Some output is not a direct reply to our input: it may be spontaneous or a delayed reply to an earlier command.
2. Following the plan, decide the exact next string to send. When in doubt, consult the help system.
3. Decide whether the task is complete (enough information to conclude).
4. If you cannot make progress no matter what you send, report the task as stuck and say why.
5. If the task involves identifying the environment, give its type.

Reply strictly as JSON:
{{
    "analysis": "your detailed analysis...",
    "next_payload": "the exact string to send next",
    "task_completed": true/false,
    "task_result": "short summary of the result if completed, otherwise empty",
    "task_stuck": true/false,
    "stuck_reason": "why no progress is possible, including partial results, otherwise empty",
    "environment_type": "mud/shell/chat/llm_qa/bbs/other/non_text if identified, otherwise null"
}}"#,
        phase = ctx.phase,
        phase_name = ctx.phase_name,
        output = ctx.output,
    );
    let user = format!(
        "The server said: {}. For task [{task_id}], what is your next action?",
        ctx.output
    );
    OraclePrompt { system, user }
}

pub fn execution_plan(
    phase: u32,
    phase_name: &str,
    task: &Task,
    knowledge: &[KnowledgeEntry],
    knowledge_limit: usize,
) -> OraclePrompt {
    let knowledge = format_knowledge(knowledge, knowledge_limit, false);
    let system = format!(
        r#"You are a task planning expert. Draft a concrete execution plan for the task below.

Current phase: {phase} - {phase_name}
Task: {description}

Knowledge:
{knowledge}

Keep the plan short: what the analyst should watch for, which results to expect, and how to tell the task is done.

Reply strictly as JSON:
{{"plan": "the execution plan..."}}"#,
        description = task.description,
    );
    OraclePrompt {
        system,
        user: format!("Draft an execution plan for task {}.", task.id),
    }
}

pub fn phase_tasks(
    phase: u32,
    summaries: &[PhaseSummary],
    knowledge: &[KnowledgeEntry],
    knowledge_limit: usize,
    environment: EnvironmentKind,
) -> OraclePrompt {
    let phases = format_summaries(summaries);
    let knowledge = format_knowledge(knowledge, knowledge_limit, false);
    let system = format!(
        r#"You are a planner. Based on the work done so far and what is known, draft the task list for a new phase.

Environment type: {environment}

Completed phases and tasks:
{phases}

Knowledge so far:
{knowledge}

Your job:
1. Summarise what has been accomplished in this environment.
2. Identify the important goals still open.
3. From that, infer the tasks for phase {phase}.

Task rules:
- Build on previous results; do not repeat finished work.
- Each task must be concrete, executable and verifiable.
- Two to five tasks per phase.

Reply strictly as JSON:
{{
    "phase_name": "name of this phase",
    "status_summary": "we have done X and learned Y...",
    "gap_analysis": "Z is still missing...",
    "reasoning": "so this phase focuses on...",
    "tasks": [
        {{"id": "P{phase}-T1", "description": "task description..."}},
        {{"id": "P{phase}-T2", "description": "task description..."}}
    ]
}}"#
    );
    OraclePrompt {
        system,
        user: format!("Draft the tasks for phase {phase}."),
    }
}

pub fn phase_name(
    phase: u32,
    summaries: &[PhaseSummary],
    environment: EnvironmentKind,
) -> OraclePrompt {
    let done = if summaries.is_empty() {
        "none".to_string()
    } else {
        summaries
            .iter()
            .map(|s| format!("phase {}: {}", s.number, s.name))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let system = format!(
        r#"You are a planner. Name phase {phase} given the phases completed so far.
Environment type: {environment}
Completed phases: {done}

Reply strictly as JSON:
{{"phase_name": "short phase name"}}"#
    );
    OraclePrompt {
        system,
        user: format!("Name phase {phase}."),
    }
}

pub fn stuck_verdict(
    phase: u32,
    task: &Task,
    reason: &str,
    knowledge: &[KnowledgeEntry],
) -> OraclePrompt {
    let knowledge = format_knowledge(knowledge, STUCK_KNOWLEDGE_LIMIT, false);
    let system = format!(
        r#"You are a project manager. A task of phase {phase} is stuck: the analyst tried many times without finishing it.
Decide how to handle it.

Task:
ID: {id}
Description: {description}
Original plan: {plan}

Why it is stuck / current state:
{reason}

Relevant knowledge:
{knowledge}

Options:
1. "skip": the task is not essential for this phase, or the environment clearly does not support it.
2. "completed": despite the errors the core goal was reached, or the stuck reason shows we already have the information.
3. "pending": the task is essential. Rewrite its description (simpler, or from a different angle) so it can be retried later.

Reply strictly as JSON:
{{
    "action": "skip" | "completed" | "pending",
    "reasoning": "why...",
    "new_description": "rewritten description if pending, otherwise the original",
    "result_summary": "result summary if skip or completed, based on the stuck reason"
}}"#,
        id = task.id,
        description = task.description,
        plan = task.plan.as_deref().unwrap_or("none"),
    );
    OraclePrompt {
        system,
        user: "Decide how to handle the stuck task.".to_string(),
    }
}

/// Inputs for the periodic fact review.
#[derive(Debug, Clone, Copy)]
pub struct ReviewContext<'a> {
    pub phase: u32,
    pub phase_name: &'a str,
    pub tasks: &'a [Task],
    pub previous: &'a [KnowledgeEntry],
    pub current: &'a [KnowledgeEntry],
    pub history: &'a [String],
    pub output: &'a str,
}

pub fn knowledge_review(ctx: &ReviewContext<'_>) -> OraclePrompt {
    let mut tasks = String::new();
    for task in ctx.tasks {
        let description: String = task.description.chars().take(80).collect();
        let _ = writeln!(
            tasks,
            "- [{}] {description} (status: {})",
            task.id,
            task.status.as_str()
        );
    }
    let previous = if ctx.previous.is_empty() {
        "No knowledge from earlier phases.".to_string()
    } else {
        format_knowledge(ctx.previous, REVIEW_PREVIOUS_LIMIT, true)
    };
    let current = format_knowledge(ctx.current, usize::MAX, false);
    let history = format_history(ctx.history, true);

    let system = format!(
        r#"You are a knowledge base curator for the current phase.

Current phase: {phase} - {phase_name}

Tasks of this phase:
{tasks}
Knowledge from earlier phases (reference):
{previous}
Knowledge of this phase:
{current}
Recent interaction history:
{history}

Latest server output:
"{output}"

Your job:
1. Given this phase's tasks, decide where the knowledge base should focus.
2. Extract valuable new information from the history and list the keywords relevant to this phase's tasks.
3. Tag every entry with a category:
   - "input_triggered": information the server returned in response to something we sent
   - "spontaneous": output the server produces without our input (banners, broadcasts, timers)
4. Do not add information already in the knowledge base.
5. Do not record meaningless system noise.

Reply strictly as JSON:
{{
    "kb_focus": "what this phase's knowledge should focus on",
    "reasoning": "your analysis...",
    "new_entries": [
        {{"content": "the fact...", "category": "input_triggered or spontaneous"}}
    ],
    "keywords": ["keyword1", "keyword2"]
}}

If there is nothing new, new_entries must be an empty list []."#,
        phase = ctx.phase,
        phase_name = ctx.phase_name,
        output = ctx.output,
    );
    OraclePrompt {
        system,
        user: "Review the interaction history and update this phase's knowledge base.".to_string(),
    }
}

pub fn consolidation(phase: u32, phase_name: &str, entries: &[KnowledgeEntry]) -> OraclePrompt {
    let mut listing = String::new();
    for (i, entry) in entries.iter().enumerate() {
        let _ = writeln!(listing, "{}. [{}] {}", i + 1, entry.category, entry.content);
    }
    let system = format!(
        r#"You are a knowledge base editor. Clean up the knowledge base below:

1. Merge entries that mean the same or nearly the same thing.
2. Drop or mark outdated information.
3. Make sure every entry has the right category (input_triggered or spontaneous).
4. Keep the knowledge accurate and concise.

Current phase: {phase} - {phase_name}

Knowledge base:
{listing}
Reply strictly as JSON:
{{
    "reasoning": "how you consolidated...",
    "consolidated_entries": [
        {{"content": "consolidated fact...", "category": "input_triggered or spontaneous"}}
    ]
}}"#
    );
    OraclePrompt {
        system,
        user: "Consolidate the knowledge base.".to_string(),
    }
}
