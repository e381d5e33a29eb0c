//! Judge phase: two-pass independent evaluation and the remediation loop.
//!
//! Runs only behind the watermark barrier (the implement phase returns only
//! once every in-scope task and triggered maintenance run is terminal). The
//! evaluation happens in a fresh detached worktree of the remote target
//! branch; verdicts are persisted per iteration so historical runs stay
//! inspectable.

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::backend::JudgeRequest;
use crate::core::types::{JudgeResult, JudgeVerdict, TaskStatus, TriageAction};
use crate::io::event_log::Event;
use crate::io::store::TaskDraft;
use crate::run::Orchestrator;

/// What the orchestrator should do after one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeOutcome {
    /// The run is done.
    Passed,
    /// Loop back to implement (after a failed verdict or a failed
    /// evaluation), bounded by the iteration cap.
    NeedsIteration,
}

/// Execute one judge iteration.
#[instrument(skip_all, fields(run_id = %o.checkpoint.run.run_id, iteration = o.checkpoint.run.iteration))]
pub fn run(o: &mut Orchestrator) -> Result<JudgeOutcome> {
    // Pick up task closures and observation tasks the agents pushed.
    o.store.sync()?;

    let iteration = o.checkpoint.run.iteration;
    let observations: Vec<String> = o
        .store
        .list_by_label(&o.observation_label())?
        .into_iter()
        .filter(|t| !t.status.is_terminal())
        .map(|t| t.id)
        .collect();
    o.checkpoint.observations = observations.iter().cloned().collect();
    o.save_checkpoint()?;

    let worktree = o
        .worktrees
        .judge_worktree(iteration, &o.checkpoint.run.target_branch)?;
    let request = JudgeRequest {
        workdir: worktree.path.clone(),
        frozen_spec_path: o.checkpoint.run.frozen_spec_path.clone(),
        acceptance_path: o.checkpoint.run.acceptance_path.clone(),
        observation_task_ids: observations,
        timeout: Duration::from_secs(o.config.judge_timeout_secs),
        env: Vec::new(),
        scratch_dir: o.paths.scratch.join(format!("judge-{iteration}")),
    };
    let result = o.judge_backend.evaluate(&request)?;
    o.worktrees.remove(&worktree)?;

    write_verdict(o, iteration, &result)?;
    o.commit_event(Event::JudgeVerdict {
        iteration,
        verdict: result.verdict,
    })?;

    match result.verdict {
        JudgeVerdict::Pass => {
            info!(iteration, "judge passed the run");
            Ok(JudgeOutcome::Passed)
        }
        JudgeVerdict::Error => {
            // A failed evaluation is a failed iteration, eligible for the
            // iteration-cap check, not a crash of the whole run.
            warn!(iteration, summary = %result.summary, "evaluation failed");
            Ok(JudgeOutcome::NeedsIteration)
        }
        JudgeVerdict::Fail => {
            info!(
                iteration,
                findings = result.drift_findings.len(),
                remediation = result.remediation.len(),
                "judge failed the run; materializing follow-up tasks"
            );
            materialize(o, &result)?;
            Ok(JudgeOutcome::NeedsIteration)
        }
    }
}

fn write_verdict(o: &Orchestrator, iteration: u32, result: &JudgeResult) -> Result<()> {
    let path = o.paths.verdict(iteration);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut payload = serde_json::to_string_pretty(result).context("serialize verdict")?;
    payload.push('\n');
    fs::write(&path, payload).with_context(|| format!("write verdict {}", path.display()))?;
    debug!(path = %path.display(), "verdict recorded");
    Ok(())
}

/// Turn judge output into next-iteration tasks: triage observations, create
/// remediation tasks, and wire their dependency edges.
fn materialize(o: &mut Orchestrator, result: &JudgeResult) -> Result<()> {
    let run_label = o.run_label();

    for decision in &result.triage {
        match decision.action {
            TriageAction::Promote => {
                o.store.add_label(&decision.task_id, &run_label)?;
                o.store.update_status(&decision.task_id, TaskStatus::Open)?;
                debug!(task_id = %decision.task_id, "observation promoted");
            }
            TriageAction::Dismiss => {
                o.store.close(&decision.task_id)?;
                debug!(task_id = %decision.task_id, "observation dismissed");
            }
            TriageAction::Merge => {
                // The surviving task (merge_into) carries the work; this one
                // closes as a duplicate.
                o.store.close(&decision.task_id)?;
                debug!(
                    task_id = %decision.task_id,
                    into = decision.merge_into.as_deref().unwrap_or("?"),
                    "observation merged"
                );
            }
        }
        o.checkpoint.observations.remove(&decision.task_id);
    }

    // Create every remediation task first, then wire edges: a dependency may
    // point at a task created later in the list.
    let mut ids_by_title: HashMap<&str, String> = HashMap::new();
    for task in &result.remediation {
        let id = o.store.create(&TaskDraft {
            title: task.title.clone(),
            description: task.description.clone(),
            labels: vec![run_label.clone()],
            priority: 0,
            blocks: Vec::new(),
        })?;
        ids_by_title.insert(task.title.as_str(), id);
    }
    for task in &result.remediation {
        let Some(blocked_id) = ids_by_title.get(task.title.as_str()) else {
            continue;
        };
        for dep_title in &task.depends_on {
            if let Some(blocker_id) = ids_by_title.get(dep_title.as_str()) {
                o.store.add_block(blocker_id, blocked_id)?;
            } else {
                warn!(
                    title = %task.title,
                    dependency = %dep_title,
                    "remediation dependency names no task in this verdict; skipping edge"
                );
            }
        }
    }

    o.commit_event(Event::TasksMaterialized {
        iteration: o.checkpoint.run.iteration,
        count: result.remediation.len(),
    })?;
    Ok(())
}
