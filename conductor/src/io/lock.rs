//! Heartbeat-based run lock.
//!
//! One orchestrator process acts as scheduler for a run at a time. The lock
//! is an advisory file carrying the holder's identity and a heartbeat; a lock
//! is reclaimable only when the heartbeat is stale AND the recorded process
//! is independently verified dead; staleness alone could be clock skew.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::io::process::process_alive;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub run_id: String,
    pub pid: u32,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// The run is locked by another live (or unverifiable) orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHeldError {
    pub holder: LockRecord,
}

impl std::fmt::Display for LockHeldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "run {} is locked by pid {} on {} (last heartbeat {})",
            self.holder.run_id, self.holder.pid, self.holder.host, self.holder.heartbeat_at
        )
    }
}

impl std::error::Error for LockHeldError {}

/// A held run lock. Release deletes the file; dropping without release
/// leaves it for the next acquirer's liveness check.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    record: LockRecord,
}

impl RunLock {
    /// Acquire the lock for `run_id`, reclaiming an abandoned one.
    pub fn acquire(path: &Path, run_id: &str, stale_after: Duration) -> Result<Self> {
        let record = LockRecord {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            host: local_host(),
            started_at: Utc::now(),
            heartbeat_at: Utc::now(),
        };

        match try_create(path, &record) {
            Ok(()) => {
                debug!(path = %path.display(), "lock acquired");
                return Ok(Self {
                    path: path.to_path_buf(),
                    record,
                });
            }
            Err(err) if !is_already_exists(&err) => return Err(err),
            Err(_) => {}
        }

        let holder = read_record(path)?;
        if !reclaimable(&holder, stale_after) {
            return Err(LockHeldError { holder }.into());
        }

        warn!(
            holder_pid = holder.pid,
            last_heartbeat = %holder.heartbeat_at,
            "reclaiming abandoned lock"
        );
        // Remove-then-create keeps reclaim race-free: when two orchestrators
        // race here, exactly one create_new succeeds.
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("remove {}", path.display())),
        }
        try_create(path, &record).context("lock reclaimed by another orchestrator")?;
        info!(path = %path.display(), "abandoned lock reclaimed");
        Ok(Self {
            path: path.to_path_buf(),
            record,
        })
    }

    /// Refresh the heartbeat timestamp.
    pub fn heartbeat(&mut self) -> Result<()> {
        self.record.heartbeat_at = Utc::now();
        write_record(&self.path, &self.record)
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Release the lock on clean exit.
    pub fn release(self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove lock {}", self.path.display())),
        }
    }
}

/// A lock is abandoned only when its heartbeat is stale and its process is
/// verified dead. A foreign host's process cannot be verified, so foreign
/// locks are never reclaimed.
fn reclaimable(holder: &LockRecord, stale_after: Duration) -> bool {
    let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
    let stale = Utc::now() - holder.heartbeat_at > stale_after;
    stale && holder.host == local_host() && !process_alive(holder.pid as i32)
}

fn try_create(path: &Path, record: &LockRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("create lock {}", path.display()))?;
    serde_json::to_writer_pretty(&file, record).context("serialize lock record")?;
    file.sync_all()
        .with_context(|| format!("flush lock {}", path.display()))?;
    Ok(())
}

fn write_record(path: &Path, record: &LockRecord) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(record).context("serialize lock record")?;
    payload.push('\n');
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload).with_context(|| format!("write temp lock {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replace lock {}", path.display()))?;
    Ok(())
}

fn read_record(path: &Path) -> Result<LockRecord> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read lock {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse lock {}", path.display()))
}

fn is_already_exists(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|io| io.kind() == ErrorKind::AlreadyExists)
}

fn local_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

/// Read the current lock holder, if any (status reporting).
pub fn current_holder(path: &Path) -> Result<Option<LockRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    read_record(path).map(Some)
}
