//! Git adapter for orchestrator commands.
//!
//! The orchestrator creates branches and worktrees deterministically, so we
//! keep a small, explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current HEAD short SHA (stable given repo state).
    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Check whether a branch exists on the remote tracking refs.
    pub fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/remotes/origin/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create a branch at the given start point without checking it out.
    #[instrument(skip_all, fields(branch, start_point))]
    pub fn create_branch(&self, branch: &str, start_point: &str) -> Result<()> {
        debug!(branch, start_point, "creating branch");
        self.run_checked(&["branch", branch, start_point])?;
        Ok(())
    }

    /// Delete a local branch, tolerating a branch that is already gone.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        if !self.branch_exists(branch)? {
            return Ok(());
        }
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Fetch from origin.
    pub fn fetch(&self) -> Result<()> {
        self.run_checked(&["fetch", "--prune", "origin"])?;
        Ok(())
    }

    /// Push a branch to origin, setting upstream.
    #[instrument(skip_all, fields(branch))]
    pub fn push_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "pushing branch");
        self.run_checked(&["push", "--set-upstream", "origin", branch])?;
        Ok(())
    }

    /// Add a worktree at `path` on a new branch starting from `start_point`.
    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub fn worktree_add_branch(&self, path: &Path, branch: &str, start_point: &str) -> Result<()> {
        debug!(branch, start_point, "adding worktree on new branch");
        let path_arg = path_arg(path);
        self.run_checked(&["worktree", "add", &path_arg, "-b", branch, start_point])?;
        Ok(())
    }

    /// Add a worktree at `path` with an existing branch checked out.
    pub fn worktree_add_existing(&self, path: &Path, branch: &str) -> Result<()> {
        let path_arg = path_arg(path);
        self.run_checked(&["worktree", "add", &path_arg, branch])?;
        Ok(())
    }

    /// Add a detached worktree at `path` pointing at `commitish`.
    #[instrument(skip_all, fields(path = %path.display(), commitish))]
    pub fn worktree_add_detached(&self, path: &Path, commitish: &str) -> Result<()> {
        debug!(commitish, "adding detached worktree");
        let path_arg = path_arg(path);
        self.run_checked(&["worktree", "add", "--detach", &path_arg, commitish])?;
        Ok(())
    }

    /// Remove a worktree and prune tracking metadata. Idempotent.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        if path.exists() {
            let path_arg = path_arg(path);
            let output = self.run(&["worktree", "remove", "--force", &path_arg])?;
            if !output.status.success() {
                // The directory may not be a registered worktree (partial
                // creation); fall back to removing it directly.
                std::fs::remove_dir_all(path)
                    .with_context(|| format!("remove worktree dir {}", path.display()))?;
            }
        }
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
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

    #[test]
    fn branch_lifecycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        let git = Git::new(temp.path());

        assert!(!git.branch_exists("feature").expect("exists"));
        git.create_branch("feature", "HEAD").expect("create");
        assert!(git.branch_exists("feature").expect("exists"));
        git.delete_branch("feature").expect("delete");
        assert!(!git.branch_exists("feature").expect("exists"));
        // Deleting again is fine.
        git.delete_branch("feature").expect("delete again");
    }

    #[test]
    fn worktree_add_and_idempotent_remove() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        fs::create_dir_all(&repo).expect("mkdir");
        init_repo(&repo);
        let git = Git::new(&repo);

        let wt = temp.path().join("wt");
        git.worktree_add_branch(&wt, "scratch", "HEAD").expect("add");
        assert!(wt.join("README.md").exists());

        git.worktree_remove(&wt).expect("remove");
        assert!(!wt.exists());
        git.worktree_remove(&wt).expect("remove again");
    }

    #[test]
    fn detached_worktree_checks_out_commit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        fs::create_dir_all(&repo).expect("mkdir");
        init_repo(&repo);
        let git = Git::new(&repo);

        let wt = temp.path().join("wt-detached");
        git.worktree_add_detached(&wt, "HEAD").expect("add");
        assert!(wt.join("README.md").exists());
        git.worktree_remove(&wt).expect("remove");
    }
}
