//! Shared deterministic types for orchestrator core logic.
//!
//! These types define stable contracts between core components. They should
//! not depend on external state or I/O and must remain deterministic across
//! runs.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task in the external store.
///
/// `Blocked` is terminal in the "no further scheduling" sense but does not
/// unblock dependents: only `Closed` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Closed,
    Blocked,
}

impl TaskStatus {
    /// True once no agent will ever be assigned to this task again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Closed | TaskStatus::Blocked)
    }
}

/// One task as read from the external store.
///
/// Dependency edges are stored inverted: `blocks` lives on the blocking task
/// and names the tasks it blocks. [`crate::core::graph::build_graph`] is the
/// only place that turns this convention into forward/reverse edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    /// Higher wins when impact depth ties.
    #[serde(default)]
    pub priority: u32,
    /// Creation sequence number; oldest first is the final tie-break.
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Tasks this task blocks (inverted storage convention).
    #[serde(default)]
    pub blocks: Vec<String>,
}

impl TaskRecord {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Phase of the run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Freeze,
    Decompose,
    Implement,
    Judge,
    Completed,
    Failed,
}

/// What a spawned agent was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Acceptance,
    Decompose,
    Task,
    Maintenance,
    Judge,
}

/// Terminal status of one spawned agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Success,
    Failure,
    Timeout,
}

/// Normalized outcome of one agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    pub status: AgentStatus,
    pub exit_code: Option<i32>,
    /// Bounded tail of interleaved stdout/stderr lines.
    pub tail: Vec<String>,
    pub duration_ms: u64,
}

/// Verdict of one judge iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeVerdict {
    Pass,
    Fail,
    /// The evaluation itself failed (pass 1 timed out or crashed).
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    Low,
    Medium,
    High,
}

/// One divergence between the frozen specification and the implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftFinding {
    pub section: String,
    pub description: String,
    pub severity: DriftSeverity,
}

/// Result for one acceptance criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub passed: bool,
    pub evidence: String,
}

/// What the judge decided about one observation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageAction {
    Promote,
    Dismiss,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageDecision {
    pub task_id: String,
    pub action: TriageAction,
    /// Target task id when `action` is `Merge`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_into: Option<String>,
}

/// A new task the judge wants created for the next iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationTask {
    pub title: String,
    pub description: String,
    /// Titles of other remediation tasks in the same verdict that must land
    /// first; resolved to real ids when the tasks are materialized.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Structured verdict from one evaluation pass over the run's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub verdict: JudgeVerdict,
    pub summary: String,
    #[serde(default)]
    pub drift_findings: Vec<DriftFinding>,
    #[serde(default)]
    pub criteria: Vec<CriterionResult>,
    #[serde(default)]
    pub triage: Vec<TriageDecision>,
    #[serde(default)]
    pub remediation: Vec<RemediationTask>,
}

impl JudgeResult {
    /// A failure result that records why pass 1 never produced findings.
    pub fn evaluation_error(summary: impl Into<String>) -> Self {
        Self {
            verdict: JudgeVerdict::Error,
            summary: summary.into(),
            drift_findings: Vec::new(),
            criteria: Vec::new(),
            triage: Vec::new(),
            remediation: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Closed.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::Open.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn task_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn judge_result_round_trips() {
        let result = JudgeResult {
            verdict: JudgeVerdict::Fail,
            summary: "two criteria failed".to_string(),
            drift_findings: vec![DriftFinding {
                section: "4.2".to_string(),
                description: "missing retry".to_string(),
                severity: DriftSeverity::High,
            }],
            criteria: vec![CriterionResult {
                criterion: "builds".to_string(),
                passed: true,
                evidence: "exit 0".to_string(),
            }],
            triage: vec![TriageDecision {
                task_id: "t-9".to_string(),
                action: TriageAction::Promote,
                merge_into: None,
            }],
            remediation: vec![RemediationTask {
                title: "add retry".to_string(),
                description: "see finding".to_string(),
                depends_on: Vec::new(),
            }],
        };
        let json = serde_json::to_string(&result).expect("serialize");
        let back: JudgeResult = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, result);
    }
}
