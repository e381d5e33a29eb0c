//! Deterministic next-task selection and deadlock classification.
//!
//! All scheduling decisions run on the single control thread; these functions
//! are pure so repeated calls over the same inputs return the same ordering.

use std::collections::BTreeSet;

use crate::core::graph::{DepGraph, impact_depth};
use crate::core::types::{AgentResult, AgentStatus, TaskRecord, TaskStatus};

/// Why no further task can ever be assigned.
///
/// The two variants require different operator remediation and must not be
/// conflated: an out-of-scope blocker needs the other run (or a human) to
/// close it, a failed blocker needs its task unwedged or the edge removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deadlock {
    /// Open tasks are blocked only by tasks outside this run's scope.
    OutOfScopeBlocker {
        task_id: String,
        blockers: Vec<String>,
    },
    /// Open tasks are blocked by a task that permanently failed.
    FailedBlocker {
        task_id: String,
        blockers: Vec<String>,
    },
}

/// Pick the next task to assign.
///
/// Candidates are open, unclaimed, in-set roots. Ranking: impact depth
/// descending, then priority descending, then creation sequence ascending.
pub fn next_task<'a>(
    graph: &DepGraph,
    tasks: &'a [TaskRecord],
    claimed: &BTreeSet<String>,
) -> Option<&'a TaskRecord> {
    ranked_candidates(graph, tasks, claimed).into_iter().next()
}

/// All currently assignable tasks in assignment order.
pub fn ranked_candidates<'a>(
    graph: &DepGraph,
    tasks: &'a [TaskRecord],
    claimed: &BTreeSet<String>,
) -> Vec<&'a TaskRecord> {
    let mut candidates: Vec<(&TaskRecord, usize)> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Open)
        .filter(|t| !claimed.contains(&t.id))
        .filter(|t| graph.is_root(&t.id))
        .map(|t| (t, impact_depth(graph, &t.id)))
        .collect();
    candidates.sort_by(|(a, depth_a), (b, depth_b)| {
        depth_b
            .cmp(depth_a)
            .then(b.priority.cmp(&a.priority))
            .then(a.seq.cmp(&b.seq))
            // Ids never collide in practice; this keeps the order total.
            .then(a.id.cmp(&b.id))
    });
    candidates.into_iter().map(|(t, _)| t).collect()
}

/// Classify a stall where open tasks remain but nothing is assignable.
///
/// Only meaningful when no agents are running; an in-flight agent may still
/// close a blocker. Returns one entry per stuck open task.
pub fn classify_deadlock(graph: &DepGraph, tasks: &[TaskRecord]) -> Vec<Deadlock> {
    let mut out = Vec::new();
    for task in tasks {
        if task.status != TaskStatus::Open || graph.is_root(&task.id) {
            continue;
        }
        let open = graph.open_blockers(&task.id);
        let external: Vec<String> = open
            .iter()
            .filter(|b| !graph.contains(b))
            .map(|b| b.to_string())
            .collect();
        let failed: Vec<String> = open
            .iter()
            .filter(|b| graph.status.get(**b) == Some(&TaskStatus::Blocked))
            .map(|b| b.to_string())
            .collect();
        // A task waiting on an in-scope open blocker is not deadlocked itself;
        // the blocker's own classification explains the stall.
        if !failed.is_empty() {
            out.push(Deadlock::FailedBlocker {
                task_id: task.id.clone(),
                blockers: failed,
            });
        } else if !external.is_empty() && external.len() == open.len() {
            out.push(Deadlock::OutOfScopeBlocker {
                task_id: task.id.clone(),
                blockers: external,
            });
        }
    }
    out
}

/// How a failed attempt should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Timeout or crash: prior worktree state is suspect, start over.
    FreshWorktree,
    /// Clean exit without closing the task: keep the agent's partial work.
    ReuseWorktree,
}

/// What to do with a finished agent, given whether its task reached closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Done,
    Retry(RetryMode),
}

/// Reconcile an agent's process result against the task's actual state.
///
/// A closed task is done no matter how the process exited; the terminal
/// transition is the agent's to make and it already happened.
pub fn classify_attempt(result: &AgentResult, task_closed: bool) -> AttemptOutcome {
    if task_closed {
        return AttemptOutcome::Done;
    }
    match result.status {
        AgentStatus::Timeout | AgentStatus::Failure => {
            AttemptOutcome::Retry(RetryMode::FreshWorktree)
        }
        AgentStatus::Success => AttemptOutcome::Retry(RetryMode::ReuseWorktree),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::build_graph;

    fn task(id: &str, status: TaskStatus, blocks: &[&str]) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            status,
            priority: 0,
            seq: 0,
            labels: Vec::new(),
            blocks: blocks.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Scheduling must be deterministic and idempotent: the full ranking is
    /// identical across repeated calls.
    #[test]
    fn ranking_is_deterministic() {
        // "base" unblocks two tasks, "mid" one, "leaf" none.
        let tasks = vec![
            task("leaf", TaskStatus::Open, &[]),
            task("base", TaskStatus::Open, &["u1", "u2"]),
            task("mid", TaskStatus::Open, &["u1"]),
            task("u1", TaskStatus::Open, &[]),
            task("u2", TaskStatus::Open, &[]),
        ];
        let graph = build_graph(&tasks);
        let claimed = BTreeSet::new();

        let first: Vec<&str> = ranked_candidates(&graph, &tasks, &claimed)
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        let second: Vec<&str> = ranked_candidates(&graph, &tasks, &claimed)
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(first, second);
        assert_eq!(first, vec!["base", "mid", "leaf"]);
    }

    #[test]
    fn priority_breaks_impact_ties_then_creation_order() {
        let mut low = task("low", TaskStatus::Open, &[]);
        low.priority = 1;
        low.seq = 1;
        let mut high = task("high", TaskStatus::Open, &[]);
        high.priority = 5;
        high.seq = 2;
        let mut old = task("old", TaskStatus::Open, &[]);
        old.priority = 1;
        old.seq = 0;

        let tasks = vec![low, high, old];
        let graph = build_graph(&tasks);
        let ranked: Vec<&str> = ranked_candidates(&graph, &tasks, &BTreeSet::new())
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ranked, vec!["high", "old", "low"]);
    }

    #[test]
    fn claimed_tasks_are_skipped() {
        let tasks = vec![
            task("a", TaskStatus::Open, &[]),
            task("b", TaskStatus::Open, &[]),
        ];
        let graph = build_graph(&tasks);
        let claimed: BTreeSet<String> = ["a".to_string()].into();
        let next = next_task(&graph, &tasks, &claimed).expect("candidate");
        assert_eq!(next.id, "b");
    }

    #[test]
    fn blocked_dependent_becomes_schedulable_when_blocker_closes() {
        let tasks = vec![
            task("x", TaskStatus::Open, &["y"]),
            task("y", TaskStatus::Open, &[]),
        ];
        let graph = build_graph(&tasks);
        let next = next_task(&graph, &tasks, &BTreeSet::new()).expect("candidate");
        assert_eq!(next.id, "x");

        let tasks = vec![
            task("x", TaskStatus::Closed, &["y"]),
            task("y", TaskStatus::Open, &[]),
        ];
        let graph = build_graph(&tasks);
        let next = next_task(&graph, &tasks, &BTreeSet::new()).expect("candidate");
        assert_eq!(next.id, "y");
    }

    #[test]
    fn deadlock_separates_external_from_failed_blockers() {
        let tasks = vec![
            task("failed", TaskStatus::Blocked, &["stuck"]),
            task("stuck", TaskStatus::Open, &[]),
            task("waiting", TaskStatus::Open, &[]),
        ];
        let mut graph = build_graph(&tasks);
        graph
            .reverse
            .get_mut("waiting")
            .expect("entry")
            .push("other-run-task".to_string());

        let deadlocks = classify_deadlock(&graph, &tasks);
        assert!(deadlocks.contains(&Deadlock::FailedBlocker {
            task_id: "stuck".to_string(),
            blockers: vec!["failed".to_string()],
        }));
        assert!(deadlocks.contains(&Deadlock::OutOfScopeBlocker {
            task_id: "waiting".to_string(),
            blockers: vec!["other-run-task".to_string()],
        }));
    }

    #[test]
    fn attempt_classification_matches_retry_policy() {
        let result = |status| AgentResult {
            status,
            exit_code: Some(0),
            tail: Vec::new(),
            duration_ms: 1,
        };
        assert_eq!(
            classify_attempt(&result(AgentStatus::Timeout), false),
            AttemptOutcome::Retry(RetryMode::FreshWorktree)
        );
        assert_eq!(
            classify_attempt(&result(AgentStatus::Failure), false),
            AttemptOutcome::Retry(RetryMode::FreshWorktree)
        );
        assert_eq!(
            classify_attempt(&result(AgentStatus::Success), false),
            AttemptOutcome::Retry(RetryMode::ReuseWorktree)
        );
        assert_eq!(
            classify_attempt(&result(AgentStatus::Success), true),
            AttemptOutcome::Done
        );
        // The agent closed its task and then died; the work still landed.
        assert_eq!(
            classify_attempt(&result(AgentStatus::Failure), true),
            AttemptOutcome::Done
        );
    }
}
