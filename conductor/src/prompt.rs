//! Prompt pack builder for deterministic agent input.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use std::sync::LazyLock;

use crate::core::types::TaskRecord;

const ACCEPTANCE_TEMPLATE: &str = include_str!("prompts/acceptance.md");
const DECOMPOSE_TEMPLATE: &str = include_str!("prompts/decompose.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const MAINTENANCE_TEMPLATE: &str = include_str!("prompts/maintenance.md");
const JUDGE_PASS1_TEMPLATE: &str = include_str!("prompts/judge_pass1.md");
const JUDGE_PASS2_TEMPLATE: &str = include_str!("prompts/judge_pass2.md");

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("acceptance", ACCEPTANCE_TEMPLATE)
        .expect("acceptance template should be valid");
    env.add_template("decompose", DECOMPOSE_TEMPLATE)
        .expect("decompose template should be valid");
    env.add_template("task", TASK_TEMPLATE)
        .expect("task template should be valid");
    env.add_template("maintenance", MAINTENANCE_TEMPLATE)
        .expect("maintenance template should be valid");
    env.add_template("judge_pass1", JUDGE_PASS1_TEMPLATE)
        .expect("judge_pass1 template should be valid");
    env.add_template("judge_pass2", JUDGE_PASS2_TEMPLATE)
        .expect("judge_pass2 template should be valid");
    env
});

/// Prompt for generating acceptance criteria at freeze time.
pub fn acceptance(spec: &str) -> Result<String> {
    render("acceptance", context! { spec => spec.trim() })
}

/// Prompt for the decomposition agent.
pub fn decompose(spec: &str, run_label: &str, tracker_command: &str) -> Result<String> {
    render(
        "decompose",
        context! {
            spec => spec.trim(),
            run_label => run_label,
            tracker_command => tracker_command,
        },
    )
}

/// Inputs for a coding-agent prompt.
///
/// Deliberately excludes the acceptance-criteria location: coding agents
/// must not be able to discover the evaluation target.
#[derive(Debug, Clone)]
pub struct TaskPromptInputs<'a> {
    pub task: &'a TaskRecord,
    pub target_branch: &'a str,
    pub tracker_command: &'a str,
    pub observation_label: &'a str,
    /// Tail of the previous incomplete attempt, when retrying in place.
    pub history: Option<&'a str>,
}

/// Prompt for one coding-agent attempt.
pub fn task(inputs: &TaskPromptInputs<'_>) -> Result<String> {
    render(
        "task",
        context! {
            task_id => inputs.task.id,
            title => inputs.task.title,
            description => inputs.task.description.trim(),
            target_branch => inputs.target_branch,
            tracker_command => inputs.tracker_command,
            observation_label => inputs.observation_label,
            history => inputs.history.map(str::trim).filter(|s| !s.is_empty()),
        },
    )
}

/// Prompt for a maintenance run.
pub fn maintenance(
    target_branch: &str,
    tracker_command: &str,
    observation_label: &str,
) -> Result<String> {
    render(
        "maintenance",
        context! {
            target_branch => target_branch,
            tracker_command => tracker_command,
            observation_label => observation_label,
        },
    )
}

/// Free-form findings pass for the judge.
pub fn judge_pass1(spec: &str, acceptance: &str, observations: &[String]) -> Result<String> {
    render(
        "judge_pass1",
        context! {
            spec => spec.trim(),
            acceptance => acceptance.trim(),
            observations => observations,
        },
    )
}

/// Strict extraction pass over pass-1 findings.
pub fn judge_pass2(findings: &str, schema: &str) -> Result<String> {
    render(
        "judge_pass2",
        context! {
            findings => findings.trim(),
            schema => schema.trim(),
        },
    )
}

fn render(name: &str, ctx: minijinja::Value) -> Result<String> {
    let template = ENGINE
        .get_template(name)
        .with_context(|| format!("template {name}"))?;
    template.render(ctx).with_context(|| format!("render {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;

    fn sample_task() -> TaskRecord {
        TaskRecord {
            id: "t-1".to_string(),
            title: "Add parser".to_string(),
            description: "Parse the things.".to_string(),
            status: TaskStatus::Open,
            priority: 0,
            seq: 1,
            labels: Vec::new(),
            blocks: Vec::new(),
        }
    }

    #[test]
    fn task_prompt_contains_contract_and_task() {
        let task_record = sample_task();
        let prompt = task(&TaskPromptInputs {
            task: &task_record,
            target_branch: "conductor/run-x",
            tracker_command: "beads",
            observation_label: "conductor/run-x/observations",
            history: None,
        })
        .expect("render");

        assert!(prompt.contains("t-1"));
        assert!(prompt.contains("Add parser"));
        assert!(prompt.contains("git push origin HEAD:conductor/run-x"));
        assert!(prompt.contains("beads close t-1"));
        assert!(!prompt.contains("Previous attempt"));
    }

    #[test]
    fn task_prompt_includes_history_when_retrying() {
        let task_record = sample_task();
        let prompt = task(&TaskPromptInputs {
            task: &task_record,
            target_branch: "main",
            tracker_command: "beads",
            observation_label: "obs",
            history: Some("left tests failing"),
        })
        .expect("render");
        assert!(prompt.contains("Previous attempt"));
        assert!(prompt.contains("left tests failing"));
    }

    /// Coding-agent prompts must never leak the acceptance-criteria location.
    #[test]
    fn task_prompt_never_mentions_acceptance() {
        let task_record = sample_task();
        let prompt = task(&TaskPromptInputs {
            task: &task_record,
            target_branch: "main",
            tracker_command: "beads",
            observation_label: "obs",
            history: None,
        })
        .expect("render");
        assert!(!prompt.to_lowercase().contains("acceptance"));
    }

    #[test]
    fn judge_pass1_lists_observations() {
        let prompt = judge_pass1("SPEC", "1. builds", &["t-7".to_string(), "t-9".to_string()])
            .expect("render");
        assert!(prompt.contains("- t-7"));
        assert!(prompt.contains("- t-9"));
        assert!(prompt.contains("SPEC"));
    }

    #[test]
    fn judge_pass1_handles_no_observations() {
        let prompt = judge_pass1("SPEC", "1. builds", &[]).expect("render");
        assert!(prompt.contains("(none)"));
    }

    #[test]
    fn judge_pass2_embeds_findings_and_schema() {
        let prompt = judge_pass2("all good", "{\"type\":\"object\"}").expect("render");
        assert!(prompt.contains("all good"));
        assert!(prompt.contains("\"type\":\"object\""));
    }
}
