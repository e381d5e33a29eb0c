//! Orchestrator configuration stored in `conductor.toml`.
//!
//! Operational settings live here and are re-read on resume, so an operator
//! can tune a stuck run (concurrency, timeouts, backend) without restarting
//! it. Run identity (ids, frozen paths, branches) never comes from config;
//! it comes from the checkpoint.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Orchestrator configuration (TOML). Missing fields default to sensible
/// values; a missing file means all defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Explicit backend override (`claude`, `codex`, `custom`). Empty means
    /// auto-detect by probing the search path.
    pub backend: String,

    /// Tracker executable consumed for task CRUD.
    pub tracker_command: String,

    /// Maximum concurrently running coding agents.
    pub concurrency: usize,

    /// Wall-clock budget per coding/maintenance/decomposition agent, seconds.
    pub agent_timeout_secs: u64,

    /// Wall-clock budget per judge pass, seconds.
    pub judge_timeout_secs: u64,

    /// Retained stdout/stderr lines per agent process.
    pub tail_lines: usize,

    /// Retry budget for timeout/crash failures (fresh worktree each).
    pub max_fresh_retries: u32,

    /// Retry budget for incomplete exits (same worktree).
    pub max_reuse_retries: u32,

    /// Spawn a maintenance agent after every N completed tasks.
    pub maintenance_every: u64,

    /// Maximum judge iterations before the run stops as partial.
    pub max_iterations: u32,

    /// Heartbeat staleness threshold for run-lock reclaim, seconds.
    pub lock_stale_secs: u64,

    /// Heartbeat refresh cadence, seconds.
    pub heartbeat_secs: u64,

    /// State root override; empty means the platform default.
    pub state_root: String,

    pub custom: CustomBackendConfig,
}

/// Argv templates for the user-configurable backend. `{prompt}` and
/// `{workdir}` are substituted; without a `{prompt}` placeholder the prompt
/// is delivered on stdin.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CustomBackendConfig {
    pub command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: String::new(),
            tracker_command: "beads".to_string(),
            concurrency: 3,
            agent_timeout_secs: 30 * 60,
            judge_timeout_secs: 20 * 60,
            tail_lines: 200,
            max_fresh_retries: 2,
            max_reuse_retries: 2,
            maintenance_every: 5,
            max_iterations: 3,
            lock_stale_secs: 300,
            heartbeat_secs: 30,
            state_root: String::new(),
            custom: CustomBackendConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(anyhow!("concurrency must be > 0"));
        }
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.judge_timeout_secs == 0 {
            return Err(anyhow!("judge_timeout_secs must be > 0"));
        }
        if self.tail_lines == 0 {
            return Err(anyhow!("tail_lines must be > 0"));
        }
        if self.maintenance_every == 0 {
            return Err(anyhow!("maintenance_every must be > 0"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.lock_stale_secs == 0 || self.heartbeat_secs == 0 {
            return Err(anyhow!("lock timings must be > 0"));
        }
        if self.heartbeat_secs >= self.lock_stale_secs {
            return Err(anyhow!(
                "heartbeat_secs must be shorter than lock_stale_secs"
            ));
        }
        if self.tracker_command.trim().is_empty() {
            return Err(anyhow!("tracker_command must be set"));
        }
        if self.backend == "custom" && self.custom.command.is_empty() {
            return Err(anyhow!("backend 'custom' requires custom.command"));
        }
        Ok(())
    }

    pub fn state_root(&self) -> PathBuf {
        if self.state_root.trim().is_empty() {
            crate::io::run_dir::default_state_root()
        } else {
            PathBuf::from(&self.state_root)
        }
    }
}

/// Load config from a TOML file. Missing file returns defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
