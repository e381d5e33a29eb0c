//! Durable checkpoint storage for orchestrator state.
//!
//! The canonical checkpoint file is always either the previous fully-written
//! state or the new fully-written state: saves go through a temp file that is
//! flushed, atomically renamed over the canonical path, and followed by a
//! directory flush. Loads discard any stale temp left by an interrupted save.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::core::types::RunPhase;

/// Bump when the checkpoint layout changes incompatibly.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// A stored checkpoint whose schema version this binary cannot read.
///
/// Always fatal: silently coercing could evaluate against a different target
/// than the one originally frozen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaVersionError {
    pub found: u32,
    pub expected: u32,
}

impl std::fmt::Display for SchemaVersionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "checkpoint schema version {} does not match expected {} (refusing to coerce; \
             use a matching conductor build)",
            self.found, self.expected
        )
    }
}

impl std::error::Error for SchemaVersionError {}

/// The frozen specification no longer hashes to the recorded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecHashError {
    pub path: PathBuf,
    pub expected: String,
    pub actual: String,
}

impl std::fmt::Display for SpecHashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frozen specification {} hash mismatch: expected {}, found {} (the run's target \
             drifted; halting)",
            self.path.display(),
            self.expected,
            self.actual
        )
    }
}

impl std::error::Error for SpecHashError {}

/// Identity and progress of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub spec_path: PathBuf,
    pub frozen_spec_path: PathBuf,
    pub spec_hash: String,
    pub acceptance_path: PathBuf,
    pub target_branch: String,
    pub base_branch: String,
    /// True when the run publishes a dedicated integration branch instead of
    /// working directly against the base branch.
    pub integration_branch: bool,
    pub phase: RunPhase,
    pub iteration: u32,
}

/// Claim recorded before an agent spawns, used on resume to distinguish a
/// live in-progress attempt from an abandoned one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimToken {
    pub task_id: String,
    pub iteration: u32,
    pub attempt: u32,
    /// Pid of the orchestrator process that recorded the claim; dead on
    /// resume means the attempt never finished.
    pub pid: Option<u32>,
}

impl ClaimToken {
    pub fn render(&self, run_id: &str) -> String {
        format!("{run_id}:{}:{}:{}", self.iteration, self.task_id, self.attempt)
    }
}

/// Independent retry counters per failure class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    /// Timeout/crash retries (fresh worktree each time).
    pub fresh: u32,
    /// Incomplete retries (same worktree).
    pub reuse: u32,
}

/// Last worktree used for a task, kept for incomplete-retry reuse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeRef {
    pub path: PathBuf,
    pub branch: Option<String>,
}

/// One maintenance run and the completion watermark that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceRun {
    pub seq: u32,
    /// Completed-task count at trigger time.
    pub watermark: u64,
    pub terminal: bool,
}

/// Durable snapshot of run + task bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub run: RunRecord,
    pub saved_at: DateTime<Utc>,
    /// Tasks the orchestrator observed reach `closed`.
    pub completed: BTreeSet<String>,
    /// Tasks whose retry budget is exhausted.
    pub permanently_blocked: BTreeSet<String>,
    pub retries: BTreeMap<String, RetryCounters>,
    /// In-flight claims by task id.
    pub claims: BTreeMap<String, ClaimToken>,
    pub last_worktrees: BTreeMap<String, WorktreeRef>,
    pub maintenance: Vec<MaintenanceRun>,
    /// Observation tasks awaiting judge triage.
    pub observations: BTreeSet<String>,
}

impl Checkpoint {
    pub fn new(run: RunRecord) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            run,
            saved_at: Utc::now(),
            completed: BTreeSet::new(),
            permanently_blocked: BTreeSet::new(),
            retries: BTreeMap::new(),
            claims: BTreeMap::new(),
            last_worktrees: BTreeMap::new(),
            maintenance: Vec::new(),
            observations: BTreeSet::new(),
        }
    }
}

/// Atomically persist a checkpoint.
///
/// Flushes the temp file and the containing directory so a crash at any
/// point leaves either the prior or the new canonical file.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn save(path: &Path, tmp_path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("checkpoint path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;

    let mut stamped = checkpoint.clone();
    stamped.saved_at = Utc::now();
    let mut payload = serde_json::to_string_pretty(&stamped).context("serialize checkpoint")?;
    payload.push('\n');

    let mut file = fs::File::create(tmp_path)
        .with_context(|| format!("create temp checkpoint {}", tmp_path.display()))?;
    file.write_all(payload.as_bytes())
        .with_context(|| format!("write temp checkpoint {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("flush temp checkpoint {}", tmp_path.display()))?;
    drop(file);

    fs::rename(tmp_path, path)
        .with_context(|| format!("replace checkpoint {}", path.display()))?;
    // Make the rename itself durable.
    fs::File::open(parent)
        .and_then(|dir| dir.sync_all())
        .with_context(|| format!("flush directory {}", parent.display()))?;
    debug!(phase = ?stamped.run.phase, "checkpoint saved");
    Ok(())
}

/// Load the canonical checkpoint.
///
/// A leftover temp file from an interrupted save is discarded first; the
/// canonical file from the last successful rename is authoritative. A
/// schema-version mismatch surfaces as [`SchemaVersionError`], never as
/// partially-coerced data.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load(path: &Path, tmp_path: &Path) -> Result<Checkpoint> {
    if tmp_path.exists() {
        warn!(tmp = %tmp_path.display(), "discarding stale checkpoint temp file");
        fs::remove_file(tmp_path)
            .with_context(|| format!("remove stale temp {}", tmp_path.display()))?;
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read checkpoint {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    let found = value
        .get("schema_version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| anyhow!("checkpoint {} has no schema_version", path.display()))?
        as u32;
    if found != CHECKPOINT_SCHEMA_VERSION {
        return Err(SchemaVersionError {
            found,
            expected: CHECKPOINT_SCHEMA_VERSION,
        }
        .into());
    }
    let checkpoint: Checkpoint = serde_json::from_value(value)
        .with_context(|| format!("parse checkpoint {}", path.display()))?;
    debug!(run_id = %checkpoint.run.run_id, phase = ?checkpoint.run.phase, "checkpoint loaded");
    Ok(checkpoint)
}

/// Hex sha256 of a byte string.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex sha256 of a file's contents.
pub fn hash_file(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(hash_bytes(&contents))
}

/// Recompute the frozen specification's hash and fail hard on mismatch.
///
/// This is the run's tamper/drift detector; it runs before every phase
/// transition, not only at resume.
pub fn verify_spec_hash(path: &Path, expected: &str) -> Result<()> {
    let actual = hash_file(path)?;
    if actual != expected {
        return Err(SpecHashError {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        }
        .into());
    }
    Ok(())
}
