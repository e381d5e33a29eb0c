//! Dependency graph construction and analysis.
//!
//! The external store records a "blocks" edge on the blocking task, pointing
//! at the task it blocks. This module is the single place that inversion is
//! interpreted: `forward[blocker]` holds the tasks it unblocks and
//! `reverse[blocked]` holds its blockers. Call sites never re-derive edges.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::types::{TaskRecord, TaskStatus};

/// Derived dependency graph over one run's task set.
///
/// Edges may reference ids outside the task set (a blocker owned by another
/// run); those stay in `reverse` so deadlock classification can name them,
/// but they never appear as scheduling candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepGraph {
    /// blocker id -> ids it unblocks, sorted.
    pub forward: BTreeMap<String, Vec<String>>,
    /// blocked id -> blocker ids, sorted.
    pub reverse: BTreeMap<String, Vec<String>>,
    /// Status of every task in the set.
    pub status: BTreeMap<String, TaskStatus>,
}

impl DepGraph {
    pub fn contains(&self, id: &str) -> bool {
        self.status.contains_key(id)
    }

    /// Blockers of `id` that have not closed yet.
    ///
    /// Ids unknown to the graph (out-of-scope blockers) count as open: the
    /// orchestrator cannot observe them closing.
    pub fn open_blockers(&self, id: &str) -> Vec<&str> {
        let Some(blockers) = self.reverse.get(id) else {
            return Vec::new();
        };
        blockers
            .iter()
            .filter(|b| self.status.get(b.as_str()) != Some(&TaskStatus::Closed))
            .map(String::as_str)
            .collect()
    }

    /// True if every blocker of `id` is closed.
    pub fn is_root(&self, id: &str) -> bool {
        self.open_blockers(id).is_empty()
    }

    /// Ids of root tasks, in sorted order.
    pub fn roots(&self) -> Vec<&str> {
        self.status
            .keys()
            .filter(|id| self.is_root(id))
            .map(String::as_str)
            .collect()
    }
}

/// Build the forward/reverse edge maps from the inverted storage convention.
pub fn build_graph(tasks: &[TaskRecord]) -> DepGraph {
    let mut graph = DepGraph::default();
    for task in tasks {
        graph.status.insert(task.id.clone(), task.status);
        graph.forward.entry(task.id.clone()).or_default();
        graph.reverse.entry(task.id.clone()).or_default();
    }
    for task in tasks {
        for blocked in &task.blocks {
            graph
                .forward
                .entry(task.id.clone())
                .or_default()
                .push(blocked.clone());
            graph
                .reverse
                .entry(blocked.clone())
                .or_default()
                .push(task.id.clone());
        }
    }
    for edges in graph.forward.values_mut() {
        edges.sort();
        edges.dedup();
    }
    for edges in graph.reverse.values_mut() {
        edges.sort();
        edges.dedup();
    }
    graph
}

/// Find dependency cycles.
///
/// Runs at graph construction, before any scheduling decision: a non-empty
/// result is a hard failure for the run. Each cycle is reported as the id
/// sequence along the cycle, starting from its smallest id so output is
/// deterministic.
pub fn detect_cycles(graph: &DepGraph) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut cycles = Vec::new();

    for start in graph.status.keys() {
        if marks.contains_key(start.as_str()) {
            continue;
        }
        let mut stack: Vec<&str> = vec![start];
        let mut path: Vec<&str> = Vec::new();
        while let Some(&id) = stack.last() {
            match marks.get(id) {
                None => {
                    marks.insert(id, Mark::Visiting);
                    path.push(id);
                    if let Some(edges) = graph.forward.get(id) {
                        for next in edges {
                            // Edges leaving the task set cannot close a cycle
                            // within it.
                            if !graph.contains(next) {
                                continue;
                            }
                            match marks.get(next.as_str()) {
                                None => stack.push(next),
                                Some(Mark::Visiting) => {
                                    cycles.push(extract_cycle(&path, next));
                                }
                                Some(Mark::Done) => {}
                            }
                        }
                    }
                }
                Some(Mark::Visiting) => {
                    marks.insert(id, Mark::Done);
                    path.pop();
                    stack.pop();
                }
                Some(Mark::Done) => {
                    stack.pop();
                }
            }
        }
    }
    cycles.sort();
    cycles.dedup();
    cycles
}

fn extract_cycle(path: &[&str], back_to: &str) -> Vec<String> {
    let start = path.iter().position(|id| *id == back_to).unwrap_or(0);
    let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
    // Rotate so the smallest id leads; keeps reports stable across traversal
    // orders.
    if let Some(min_pos) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
    {
        cycle.rotate_left(min_pos);
    }
    cycle
}

/// Count of tasks transitively unblocked by `id`.
///
/// The primary scheduling rank: finishing a task with a deep downstream
/// frees the most parallelism.
pub fn impact_depth(graph: &DepGraph, id: &str) -> usize {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut stack: Vec<&str> = Vec::new();
    if let Some(edges) = graph.forward.get(id) {
        stack.extend(edges.iter().map(String::as_str));
    }
    while let Some(next) = stack.pop() {
        if next == id || !seen.insert(next) {
            continue;
        }
        if let Some(edges) = graph.forward.get(next) {
            stack.extend(edges.iter().map(String::as_str));
        }
    }
    seen.len()
}
