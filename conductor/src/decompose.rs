//! Decompose phase: adopt pre-existing tasks or spawn a decomposition agent,
//! then validate the resulting dependency graph.
//!
//! Every task ends up labeled with the run identifier for scoped retrieval.
//! Ambiguity is a hard error: open tasks with no selector means the operator
//! must say what belongs to this run; guessing either way risks double-work
//! or silently dropped scope.

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::graph::{build_graph, detect_cycles};
use crate::core::types::{AgentRole, AgentStatus};
use crate::implement::CycleError;
use crate::io::event_log::Event;
use crate::prompt;
use crate::run::Orchestrator;

/// Open tasks exist in the tracker but no adopt selector was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbiguousScopeError {
    pub open_tasks: usize,
}

impl std::fmt::Display for AmbiguousScopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} open task(s) already exist and no --adopt selector was given; pass --adopt \
             <label> to adopt them or triage them out of the tracker first",
            self.open_tasks
        )
    }
}

impl std::error::Error for AmbiguousScopeError {}

/// The adopt selector matched nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmptySelectorError {
    pub selector: String,
}

impl std::fmt::Display for EmptySelectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "adopt selector '{}' matched no tasks; refusing to guess a scope",
            self.selector
        )
    }
}

impl std::error::Error for EmptySelectorError {}

/// Execute the decompose phase.
#[instrument(skip_all, fields(run_id = %o.checkpoint.run.run_id))]
pub fn run(o: &mut Orchestrator) -> Result<()> {
    let label = o.run_label();

    let existing = o.store.list_by_label(&label)?;
    if !existing.is_empty() {
        // Resumed mid-run; the scope is already established.
        debug!(count = existing.len(), "tasks already labeled for this run");
        return validate_graph(o);
    }

    match o.adopt.clone() {
        Some(selector) => adopt(o, &selector)?,
        None => {
            let open = o.store.list_open()?;
            if !open.is_empty() {
                return Err(AmbiguousScopeError {
                    open_tasks: open.len(),
                }
                .into());
            }
            spawn_decomposer(o)?;
        }
    }
    validate_graph(o)
}

/// Label every task the selector matches with the run identifier.
fn adopt(o: &mut Orchestrator, selector: &str) -> Result<()> {
    let matched = o.store.list_by_label(selector)?;
    if matched.is_empty() {
        return Err(EmptySelectorError {
            selector: selector.to_string(),
        }
        .into());
    }
    let label = o.run_label();
    for task in &matched {
        o.store.add_label(&task.id, &label)?;
    }
    info!(count = matched.len(), selector, "adopted existing tasks");
    Ok(())
}

/// Spawn the decomposition agent to create labeled tasks from the frozen
/// specification.
fn spawn_decomposer(o: &mut Orchestrator) -> Result<()> {
    let spec = fs::read_to_string(&o.checkpoint.run.frozen_spec_path).with_context(|| {
        format!("read {}", o.checkpoint.run.frozen_spec_path.display())
    })?;
    let label = o.run_label();
    let prompt = prompt::decompose(&spec, &label, &o.config.tracker_command)?;

    o.commit_event(Event::AgentSpawned {
        role: AgentRole::Decompose,
        task_id: None,
        worktree: o.repo_root.clone(),
    })?;
    let result = o.agent_backend.spawn(&crate::backend::SpawnRequest {
        // The tracker is git-native; its commands need the repository.
        workdir: o.repo_root.clone(),
        prompt,
        system_prompt: None,
        timeout: Duration::from_secs(o.config.agent_timeout_secs),
        env: Vec::new(),
        tail_lines: o.config.tail_lines,
        scratch_dir: o.paths.scratch.join("decompose"),
    })?;
    o.commit_event(Event::AgentFinished {
        role: AgentRole::Decompose,
        task_id: None,
        status: result.status,
        exit_code: result.exit_code,
        duration_ms: result.duration_ms,
    })?;
    if result.status != AgentStatus::Success {
        return Err(anyhow!(
            "decomposition agent failed ({:?}): {}",
            result.status,
            result.tail.join("\n")
        ));
    }

    o.store.sync()?;
    let created = o.store.list_by_label(&label)?;
    if created.is_empty() {
        return Err(anyhow!(
            "decomposition agent exited successfully but created no tasks labeled {label}"
        ));
    }
    info!(count = created.len(), "decomposition created tasks");
    Ok(())
}

/// Cycles are a hard failure detected before any coding agent spawns.
fn validate_graph(o: &mut Orchestrator) -> Result<()> {
    let tasks = o.store.list_by_label(&o.run_label())?;
    let graph = build_graph(&tasks);
    let cycles = detect_cycles(&graph);
    if !cycles.is_empty() {
        return Err(CycleError { cycles }.into());
    }
    debug!(tasks = tasks.len(), "dependency graph validated");
    Ok(())
}
