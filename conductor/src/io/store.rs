//! Client for the external task store.
//!
//! The issue tracker itself is out of scope; the orchestrator consumes a
//! small command surface (list/create/update/close/sync), every operation
//! idempotent and independently retryable. The [`TaskStore`] trait decouples
//! scheduling from the concrete tracker so tests use an in-memory fake.
//!
//! The orchestrator never assumes atomic claim-and-read: exclusive
//! scheduling is the run lock's job, and the checkpoint, not the store,
//! is the source of truth for scheduling state.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::types::{TaskRecord, TaskStatus};

/// Fields for a task the orchestrator creates (decomposition output,
/// remediation, promoted observations).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDraft {
    pub title: String,
    pub description: String,
    pub labels: Vec<String>,
    pub priority: u32,
    /// Ids of tasks this new task blocks (inverted storage convention).
    pub blocks: Vec<String>,
}

/// The command surface the external tracker exposes.
pub trait TaskStore {
    /// Tasks carrying `label`, in creation order.
    fn list_by_label(&self, label: &str) -> Result<Vec<TaskRecord>>;
    /// All open tasks, regardless of label (scope-ambiguity detection).
    fn list_open(&self) -> Result<Vec<TaskRecord>>;
    fn get(&self, id: &str) -> Result<Option<TaskRecord>>;
    /// Create a task and return its id.
    fn create(&self, draft: &TaskDraft) -> Result<String>;
    fn update_status(&self, id: &str, status: TaskStatus) -> Result<()>;
    fn close(&self, id: &str) -> Result<()>;
    fn add_label(&self, id: &str, label: &str) -> Result<()>;
    /// Record that `blocker` blocks `blocked` (edge lives on the blocker).
    fn add_block(&self, blocker: &str, blocked: &str) -> Result<()>;
    /// Pull/push tracker records with its upstream.
    fn sync(&self) -> Result<()>;
}

/// Tracker client shelling out to the tracker executable with JSON exchange.
#[derive(Debug, Clone)]
pub struct CliTaskStore {
    program: String,
    workdir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CreatedTask {
    id: String,
}

impl CliTaskStore {
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            workdir: workdir.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn {} {}", self.program, args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl TaskStore for CliTaskStore {
    #[instrument(skip_all, fields(label))]
    fn list_by_label(&self, label: &str) -> Result<Vec<TaskRecord>> {
        let out = self.run(&["list", "--label", label, "--json"])?;
        let mut tasks: Vec<TaskRecord> =
            serde_json::from_str(&out).context("parse tracker list output")?;
        tasks.sort_by_key(|t| t.seq);
        debug!(count = tasks.len(), "listed tasks");
        Ok(tasks)
    }

    fn list_open(&self) -> Result<Vec<TaskRecord>> {
        let out = self.run(&["list", "--status", "open", "--json"])?;
        let mut tasks: Vec<TaskRecord> =
            serde_json::from_str(&out).context("parse tracker list output")?;
        tasks.sort_by_key(|t| t.seq);
        Ok(tasks)
    }

    fn get(&self, id: &str) -> Result<Option<TaskRecord>> {
        let out = match self.run(&["show", id, "--json"]) {
            Ok(out) => out,
            // The tracker reports unknown ids as a failure; callers treat
            // that as absence.
            Err(_) => return Ok(None),
        };
        let task: TaskRecord = serde_json::from_str(&out).context("parse tracker show output")?;
        Ok(Some(task))
    }

    #[instrument(skip_all, fields(title = %draft.title))]
    fn create(&self, draft: &TaskDraft) -> Result<String> {
        let priority = draft.priority.to_string();
        let mut args: Vec<&str> = vec![
            "create",
            "--title",
            &draft.title,
            "--description",
            &draft.description,
            "--priority",
            &priority,
        ];
        for label in &draft.labels {
            args.push("--label");
            args.push(label);
        }
        for blocked in &draft.blocks {
            args.push("--blocks");
            args.push(blocked);
        }
        args.push("--json");
        let out = self.run(&args)?;
        let created: CreatedTask =
            serde_json::from_str(&out).context("parse tracker create output")?;
        debug!(id = %created.id, "task created");
        Ok(created.id)
    }

    fn update_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let status = match status {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Closed => "closed",
            TaskStatus::Blocked => "blocked",
        };
        self.run(&["update", id, "--status", status])?;
        Ok(())
    }

    fn close(&self, id: &str) -> Result<()> {
        self.run(&["close", id])?;
        Ok(())
    }

    fn add_label(&self, id: &str, label: &str) -> Result<()> {
        self.run(&["label", id, "--add", label])?;
        Ok(())
    }

    fn add_block(&self, blocker: &str, blocked: &str) -> Result<()> {
        self.run(&["dep", blocker, "--blocks", blocked])?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.run(&["sync"])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    /// Install a fake tracker script that dumps canned JSON for `list`.
    fn fake_tracker(dir: &std::path::Path) -> String {
        let script = dir.join("tracker");
        fs::write(
            &script,
            r#"#!/bin/sh
case "$1" in
  list)
    printf '[{"id":"t-2","title":"second","status":"open","seq":2},'
    printf '{"id":"t-1","title":"first","status":"open","seq":1}]'
    ;;
  create)
    printf '{"id":"t-new"}'
    ;;
  *)
    exit 0
    ;;
esac
"#,
        )
        .expect("write script");
        let mut perms = fs::metadata(&script).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).expect("chmod");
        script.display().to_string()
    }

    #[test]
    fn list_parses_and_sorts_by_creation_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CliTaskStore::new(fake_tracker(temp.path()), temp.path());

        let tasks = store.list_by_label("run/x").expect("list");
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t-1", "t-2"]);
    }

    #[test]
    fn create_returns_new_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CliTaskStore::new(fake_tracker(temp.path()), temp.path());

        let id = store
            .create(&TaskDraft {
                title: "new".to_string(),
                ..TaskDraft::default()
            })
            .expect("create");
        assert_eq!(id, "t-new");
    }

    #[test]
    fn missing_tracker_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CliTaskStore::new("/does/not/exist", temp.path());
        assert!(store.list_by_label("run/x").is_err());
    }
}
