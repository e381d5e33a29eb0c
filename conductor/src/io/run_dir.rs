//! Per-run state directory layout.
//!
//! Everything a run persists lives under one directory namespaced by run id,
//! so historical runs stay independently inspectable and never overwrite one
//! another. The layout also keeps acceptance criteria and checkpoints outside
//! every worktree a coding agent can reach.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Paths inside one run's state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub root: PathBuf,
    /// Immutable copy of the input specification.
    pub frozen_spec: PathBuf,
    /// Generated acceptance criteria; never referenced in coding-agent
    /// prompts or environment.
    pub acceptance: PathBuf,
    pub checkpoint: PathBuf,
    pub checkpoint_tmp: PathBuf,
    pub event_log: PathBuf,
    pub lock: PathBuf,
    /// Root for ephemeral worktrees.
    pub worktrees: PathBuf,
    /// Per-iteration judge verdict records.
    pub verdicts: PathBuf,
    /// Scratch output from agent passes (pass-1 findings, schemas).
    pub scratch: PathBuf,
}

impl RunPaths {
    pub fn new(state_root: &Path, run_id: &str) -> Self {
        let root = state_root.join("runs").join(run_id);
        Self {
            frozen_spec: root.join("spec.frozen.md"),
            acceptance: root.join("acceptance.md"),
            checkpoint: root.join("checkpoint.json"),
            checkpoint_tmp: root.join("checkpoint.json.tmp"),
            event_log: root.join("events.jsonl"),
            lock: root.join("lock.json"),
            worktrees: root.join("worktrees"),
            verdicts: root.join("verdicts"),
            scratch: root.join("scratch"),
            root,
        }
    }

    pub fn verdict(&self, iteration: u32) -> PathBuf {
        self.verdicts.join(format!("iteration-{iteration}.json"))
    }

    /// Create the directory skeleton for a new run.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.root, &self.worktrees, &self.verdicts, &self.scratch] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Default state root (`$XDG_STATE_HOME/conductor` or equivalent).
pub fn default_state_root() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conductor")
}

/// Run ids present under the state root, sorted.
pub fn list_runs(state_root: &Path) -> Result<Vec<String>> {
    let runs_dir = state_root.join("runs");
    if !runs_dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(&runs_dir).with_context(|| format!("read {}", runs_dir.display()))? {
        let entry = entry.context("read runs dir entry")?;
        if entry.path().is_dir()
            && let Some(name) = entry.file_name().to_str()
        {
            ids.push(name.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

/// The run whose checkpoint was written most recently.
pub fn latest_run(state_root: &Path) -> Result<Option<String>> {
    let mut latest: Option<(std::time::SystemTime, String)> = None;
    for id in list_runs(state_root)? {
        let checkpoint = RunPaths::new(state_root, &id).checkpoint;
        let Ok(meta) = fs::metadata(&checkpoint) else {
            continue;
        };
        let mtime = meta.modified().context("checkpoint mtime")?;
        if latest.as_ref().is_none_or(|(t, _)| mtime > *t) {
            latest = Some((mtime, id));
        }
    }
    Ok(latest.map(|(_, id)| id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_namespaced_by_run_id() {
        let a = RunPaths::new(Path::new("/state"), "run-aaa");
        let b = RunPaths::new(Path::new("/state"), "run-bbb");
        assert_ne!(a.root, b.root);
        assert!(a.checkpoint.starts_with(&a.root));
        assert!(a.verdict(3).ends_with("verdicts/iteration-3.json"));
    }

    #[test]
    fn list_runs_returns_sorted_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        for id in ["run-b", "run-a"] {
            RunPaths::new(temp.path(), id).ensure_dirs().expect("dirs");
        }
        let ids = list_runs(temp.path()).expect("list");
        assert_eq!(ids, vec!["run-a".to_string(), "run-b".to_string()]);
    }

    #[test]
    fn latest_run_tracks_checkpoint_mtime() {
        let temp = tempfile::tempdir().expect("tempdir");
        for id in ["run-a", "run-b"] {
            let paths = RunPaths::new(temp.path(), id);
            paths.ensure_dirs().expect("dirs");
            fs::write(&paths.checkpoint, "{}").expect("write");
        }
        // Force run-b's checkpoint to be the newest regardless of timer
        // resolution.
        let paths_b = RunPaths::new(temp.path(), "run-b");
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        let file = fs::OpenOptions::new()
            .append(true)
            .open(&paths_b.checkpoint)
            .expect("open");
        file.set_modified(later).expect("set mtime");
        assert_eq!(
            latest_run(temp.path()).expect("latest"),
            Some("run-b".to_string())
        );
    }
}
