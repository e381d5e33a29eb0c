//! Read-only reporting: run status and the dry-run schedule preview.
//!
//! Both commands must succeed even when the underlying run previously
//! failed, so operators can always inspect what happened. Nothing here
//! mutates the run directory or the task store.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::graph::{build_graph, detect_cycles, impact_depth};
use crate::core::schedule::{Deadlock, classify_deadlock, ranked_candidates};
use crate::core::types::{JudgeResult, JudgeVerdict, RunPhase};
use crate::decompose::EmptySelectorError;
use crate::io::checkpoint;
use crate::io::config::Config;
use crate::io::event_log;
use crate::io::lock::{LockRecord, current_holder};
use crate::io::run_dir::{RunPaths, list_runs};
use crate::io::store::TaskStore;

/// A dry run needs an explicit adopt selector: previewing a schedule without
/// one would require spawning the decomposition agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorRequiredError;

impl std::fmt::Display for SelectorRequiredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dry-run requires --adopt <label>: without a selector the schedule would depend on \
             a decomposition agent, and dry-run spawns no agents"
        )
    }
}

impl std::error::Error for SelectorRequiredError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerdictSummary {
    pub iteration: u32,
    pub verdict: JudgeVerdict,
}

/// Inspectable state of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub run_id: String,
    pub phase: Option<RunPhase>,
    pub iteration: Option<u32>,
    pub target_branch: Option<String>,
    pub completed: usize,
    pub permanently_blocked: usize,
    pub in_flight_claims: usize,
    pub locked_by: Option<LockRecord>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub verdicts: Vec<VerdictSummary>,
    /// Why the checkpoint could not be read, when it could not.
    pub error: Option<String>,
}

/// Status of one run or of every run under the state root.
pub fn status(state_root: &Path, run_id: Option<&str>) -> Result<Vec<RunStatus>> {
    let ids = match run_id {
        Some(id) => vec![id.to_string()],
        None => list_runs(state_root)?,
    };
    Ok(ids.iter().map(|id| run_status(state_root, id)).collect())
}

/// Never fails: an unreadable checkpoint is reported, not propagated.
fn run_status(state_root: &Path, run_id: &str) -> RunStatus {
    let paths = RunPaths::new(state_root, run_id);
    let mut status = RunStatus {
        run_id: run_id.to_string(),
        phase: None,
        iteration: None,
        target_branch: None,
        completed: 0,
        permanently_blocked: 0,
        in_flight_claims: 0,
        locked_by: current_holder(&paths.lock).ok().flatten(),
        last_event_at: None,
        verdicts: Vec::new(),
        error: None,
    };

    match checkpoint::load(&paths.checkpoint, &paths.checkpoint_tmp) {
        Ok(checkpoint) => {
            status.phase = Some(checkpoint.run.phase);
            status.iteration = Some(checkpoint.run.iteration);
            status.target_branch = Some(checkpoint.run.target_branch);
            status.completed = checkpoint.completed.len();
            status.permanently_blocked = checkpoint.permanently_blocked.len();
            status.in_flight_claims = checkpoint.claims.len();
        }
        Err(err) => status.error = Some(format!("{err:#}")),
    }

    if let Ok(entries) = event_log::read_entries(&paths.event_log) {
        status.last_event_at = entries.last().map(|e| e.at);
    }
    for iteration in 1..=64u32 {
        let path = paths.verdict(iteration);
        let Ok(contents) = fs::read_to_string(&path) else {
            continue;
        };
        if let Ok(result) = serde_json::from_str::<JudgeResult>(&contents) {
            status.verdicts.push(VerdictSummary {
                iteration,
                verdict: result.verdict,
            });
        }
    }
    status
}

pub fn render_status(statuses: &[RunStatus]) -> String {
    let mut lines = Vec::new();
    for s in statuses {
        let phase = s
            .phase
            .map(|p| format!("{p:?}").to_lowercase())
            .unwrap_or_else(|| "unreadable".to_string());
        lines.push(format!(
            "{}  phase={}  iter={}  done={}  blocked={}  in-flight={}",
            s.run_id,
            phase,
            s.iteration.unwrap_or(0),
            s.completed,
            s.permanently_blocked,
            s.in_flight_claims,
        ));
        if let Some(lock) = &s.locked_by {
            lines.push(format!(
                "  locked by pid {} on {} (heartbeat {})",
                lock.pid, lock.host, lock.heartbeat_at
            ));
        }
        for verdict in &s.verdicts {
            lines.push(format!(
                "  iteration {}: {:?}",
                verdict.iteration, verdict.verdict
            ));
        }
        if let Some(err) = &s.error {
            lines.push(format!("  error: {err}"));
        }
    }
    lines.join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledTask {
    pub id: String,
    pub title: String,
    pub impact_depth: usize,
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedTask {
    pub id: String,
    pub open_blockers: Vec<String>,
}

/// Computed schedule for a run that has not started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunReport {
    pub run_id: String,
    pub spec_hash: String,
    pub target_branch: String,
    pub task_count: usize,
    /// Assignment order for currently-ready tasks.
    pub schedule: Vec<ScheduledTask>,
    pub blocked: Vec<BlockedTask>,
    pub cycles: Vec<Vec<String>>,
    pub deadlocks: Vec<String>,
}

/// Perform freeze and decompose bookkeeping in memory and report the
/// schedule. Spawns no agent and writes nothing.
pub fn dry_run(
    config: &Config,
    store: &dyn TaskStore,
    spec_path: &Path,
    base_branch: &str,
    integration_branch: bool,
    selector: Option<&str>,
) -> Result<DryRunReport> {
    let contents = fs::read_to_string(spec_path)
        .with_context(|| format!("read specification {}", spec_path.display()))?;
    let state_root = config.state_root();
    let run_id = crate::freeze::derive_run_id(&state_root, &contents, base_branch)?;
    let target_branch = if integration_branch {
        format!("conductor/{run_id}")
    } else {
        base_branch.to_string()
    };

    let Some(selector) = selector else {
        return Err(SelectorRequiredError.into());
    };
    let tasks = store.list_by_label(selector)?;
    if tasks.is_empty() {
        return Err(EmptySelectorError {
            selector: selector.to_string(),
        }
        .into());
    }

    let graph = build_graph(&tasks);
    let cycles = detect_cycles(&graph);
    let schedule: Vec<ScheduledTask> = ranked_candidates(&graph, &tasks, &BTreeSet::new())
        .into_iter()
        .map(|t| ScheduledTask {
            id: t.id.clone(),
            title: t.title.clone(),
            impact_depth: impact_depth(&graph, &t.id),
            priority: t.priority,
        })
        .collect();
    let blocked: Vec<BlockedTask> = tasks
        .iter()
        .filter(|t| !t.status.is_terminal() && !graph.is_root(&t.id))
        .map(|t| BlockedTask {
            id: t.id.clone(),
            open_blockers: graph
                .open_blockers(&t.id)
                .into_iter()
                .map(str::to_string)
                .collect(),
        })
        .collect();
    let deadlocks = classify_deadlock(&graph, &tasks)
        .into_iter()
        .map(|d| match d {
            Deadlock::OutOfScopeBlocker { task_id, blockers } => {
                format!("{task_id}: out-of-scope blockers {}", blockers.join(", "))
            }
            Deadlock::FailedBlocker { task_id, blockers } => {
                format!("{task_id}: failed blockers {}", blockers.join(", "))
            }
        })
        .collect();

    Ok(DryRunReport {
        run_id,
        spec_hash: checkpoint::hash_bytes(contents.as_bytes()),
        target_branch,
        task_count: tasks.len(),
        schedule,
        blocked,
        cycles,
        deadlocks,
    })
}

pub fn render_dry_run(report: &DryRunReport) -> String {
    let mut lines = vec![
        format!("run: {}", report.run_id),
        format!("target branch: {}", report.target_branch),
        format!("tasks in scope: {}", report.task_count),
    ];
    if !report.cycles.is_empty() {
        for cycle in &report.cycles {
            lines.push(format!("CYCLE: {}", cycle.join(" -> ")));
        }
    }
    lines.push("schedule:".to_string());
    for (idx, task) in report.schedule.iter().enumerate() {
        lines.push(format!(
            "  {}. {} ({}) impact={} priority={}",
            idx + 1,
            task.id,
            task.title,
            task.impact_depth,
            task.priority
        ));
    }
    for blocked in &report.blocked {
        lines.push(format!(
            "  waiting: {} <- {}",
            blocked.id,
            blocked.open_blockers.join(", ")
        ));
    }
    for deadlock in &report.deadlocks {
        lines.push(format!("DEADLOCK: {deadlock}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunPhase;
    use crate::io::checkpoint::{Checkpoint, RunRecord};

    fn sample_checkpoint(run_id: &str) -> Checkpoint {
        Checkpoint::new(RunRecord {
            run_id: run_id.to_string(),
            spec_path: "/tmp/spec.md".into(),
            frozen_spec_path: "/tmp/frozen.md".into(),
            spec_hash: "aa".to_string(),
            acceptance_path: "/tmp/acceptance.md".into(),
            target_branch: "main".to_string(),
            base_branch: "main".to_string(),
            integration_branch: false,
            phase: RunPhase::Implement,
            iteration: 1,
        })
    }

    #[test]
    fn status_reports_checkpointed_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path(), "run-a");
        paths.ensure_dirs().expect("dirs");
        checkpoint::save(
            &paths.checkpoint,
            &paths.checkpoint_tmp,
            &sample_checkpoint("run-a"),
        )
        .expect("save");

        let statuses = status(temp.path(), None).expect("status");
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].run_id, "run-a");
        assert_eq!(statuses[0].phase, Some(RunPhase::Implement));
        assert!(statuses[0].error.is_none());
    }

    /// Status must succeed even when a run's checkpoint is corrupt.
    #[test]
    fn status_survives_unreadable_checkpoint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path(), "run-bad");
        paths.ensure_dirs().expect("dirs");
        fs::write(&paths.checkpoint, "not json").expect("write");

        let statuses = status(temp.path(), Some("run-bad")).expect("status");
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].error.is_some());
        assert!(statuses[0].phase.is_none());
    }

    #[test]
    fn status_does_not_mutate_the_run_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path(), "run-a");
        paths.ensure_dirs().expect("dirs");
        checkpoint::save(
            &paths.checkpoint,
            &paths.checkpoint_tmp,
            &sample_checkpoint("run-a"),
        )
        .expect("save");
        let before = fs::read_to_string(&paths.checkpoint).expect("read");

        status(temp.path(), None).expect("status");
        let after = fs::read_to_string(&paths.checkpoint).expect("read");
        assert_eq!(before, after);
    }
}
