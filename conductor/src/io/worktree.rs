//! Ephemeral, isolated working copies for agents, maintenance and the judge.
//!
//! Every spawned process gets its own worktree checked out to a throwaway
//! branch derived from the shared target branch; the judge gets a detached
//! checkout of the remote target so it can never commit. Worktrees are
//! created immediately before use and destroyed immediately after, except on
//! interrupt, where they are deliberately left behind for manual recovery.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::io::git::Git;

/// One checked-out working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub path: PathBuf,
    /// None for detached (judge) checkouts.
    pub branch: Option<String>,
}

/// Creates and destroys worktrees for one run.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    git: Git,
    worktrees_root: PathBuf,
    run_id: String,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>, worktrees_root: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            git: Git::new(repo_root),
            worktrees_root: worktrees_root.into(),
            run_id: run_id.into(),
        }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Worktree for one coding-agent attempt.
    ///
    /// The attempt number is part of the branch and path: a retry after a
    /// timeout or crash must land in a different worktree than the failed
    /// attempt, while an "incomplete" retry reuses the previous path.
    #[instrument(skip_all, fields(task_id, attempt))]
    pub fn agent_worktree(&self, task_id: &str, attempt: u32, target_branch: &str) -> Result<Worktree> {
        let slug = format!("task-{}-a{attempt}", sanitize(task_id));
        self.branch_worktree(&slug, target_branch)
    }

    /// Worktree for one maintenance run.
    pub fn maintenance_worktree(&self, seq: u32, target_branch: &str) -> Result<Worktree> {
        let slug = format!("maint-{seq}");
        self.branch_worktree(&slug, target_branch)
    }

    /// Detached, read-only checkout of the remote target branch for a judge
    /// pass. No local branch: the judge must never commit.
    #[instrument(skip_all, fields(iteration))]
    pub fn judge_worktree(&self, iteration: u32, target_branch: &str) -> Result<Worktree> {
        let path = self.worktrees_root.join(format!("judge-{iteration}"));
        self.git.worktree_remove(&path)?;
        let commitish = self.freshest_ref(target_branch)?;
        self.git
            .worktree_add_detached(&path, &commitish)
            .with_context(|| format!("create judge worktree {}", path.display()))?;
        debug!(path = %path.display(), "judge worktree ready");
        Ok(Worktree { path, branch: None })
    }

    /// Remove a worktree and its tracking metadata. Safe to call twice.
    pub fn remove(&self, worktree: &Worktree) -> Result<()> {
        self.git.worktree_remove(&worktree.path)?;
        if let Some(branch) = &worktree.branch {
            self.git.delete_branch(branch)?;
        }
        Ok(())
    }

    /// Create and publish the shared integration branch once per run.
    #[instrument(skip_all, fields(target_branch, base_branch))]
    pub fn create_integration_branch(&self, target_branch: &str, base_branch: &str) -> Result<()> {
        if self.git.branch_exists(target_branch)? {
            debug!(target_branch, "integration branch already exists");
        } else {
            self.git
                .create_branch(target_branch, base_branch)
                .with_context(|| format!("create integration branch {target_branch}"))?;
        }
        self.git
            .push_branch(target_branch)
            .with_context(|| format!("publish integration branch {target_branch}"))?;
        info!(target_branch, "integration branch published");
        Ok(())
    }

    fn branch_worktree(&self, slug: &str, target_branch: &str) -> Result<Worktree> {
        let path = self.worktrees_root.join(slug);
        let branch = format!("conductor/{}/{slug}", self.run_id);
        // A prior attempt with the same name may have been interrupted
        // mid-creation; clear both halves before re-adding.
        self.git.worktree_remove(&path)?;
        self.git.delete_branch(&branch)?;
        let start_point = self.freshest_ref(target_branch)?;
        self.git
            .worktree_add_branch(&path, &branch, &start_point)
            .with_context(|| format!("create worktree {}", path.display()))?;
        debug!(path = %path.display(), branch = %branch, "worktree ready");
        Ok(Worktree {
            path,
            branch: Some(branch),
        })
    }

    /// Prefer the remote target branch (after a fetch) so agents start from
    /// the latest pushed work; fall back to the local branch when the repo
    /// has no remote copy (tests, offline bootstrap).
    fn freshest_ref(&self, target_branch: &str) -> Result<String> {
        if self.git.fetch().is_ok() && self.git.remote_branch_exists(target_branch)? {
            return Ok(format!("origin/{target_branch}"));
        }
        Ok(target_branch.to_string())
    }
}

/// Make an id safe for branch and directory names.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;

    fn init_repo(root: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "test"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(root)
                .status()
                .expect("git");
            assert!(status.success());
        }
        fs::write(root.join("README.md"), "hi\n").expect("write");
        for args in [vec!["add", "."], vec!["commit", "-m", "chore: init"]] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(root)
                .status()
                .expect("git");
            assert!(status.success());
        }
    }

    fn manager(temp: &Path) -> WorktreeManager {
        let repo = temp.join("repo");
        fs::create_dir_all(&repo).expect("mkdir");
        init_repo(&repo);
        WorktreeManager::new(repo, temp.join("worktrees"), "run-test")
    }

    #[test]
    fn agent_worktrees_differ_by_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager(temp.path());

        let first = manager.agent_worktree("t-1", 1, "main").expect("wt1");
        let second = manager.agent_worktree("t-1", 2, "main").expect("wt2");
        assert_ne!(first.path, second.path);
        assert_ne!(first.branch, second.branch);
        assert!(first.path.join("README.md").exists());

        manager.remove(&first).expect("remove");
        manager.remove(&second).expect("remove");
        manager.remove(&first).expect("remove twice");
    }

    #[test]
    fn judge_worktree_is_detached() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager(temp.path());

        let judge = manager.judge_worktree(1, "main").expect("judge wt");
        assert_eq!(judge.branch, None);
        assert!(judge.path.join("README.md").exists());
        manager.remove(&judge).expect("remove");
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize("ab/cd ef"), "ab-cd-ef");
        assert_eq!(sanitize("t-1.2_x"), "t-1.2_x");
    }
}
