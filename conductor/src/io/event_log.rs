//! Append-only structured event log for one run.
//!
//! Entries are JSONL. All appends go through one serialized writer: regular
//! file appends are not guaranteed atomic the way pipe writes are, and two
//! near-simultaneous completions must not interleave bytes within a line.
//! The checkpoint is always saved before the event that caused it is
//! appended, so a crash can never show more progress than was recorded.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{AgentRole, AgentStatus, JudgeVerdict, RunPhase};

/// One significant orchestrator event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    PhaseChanged {
        phase: RunPhase,
        iteration: u32,
    },
    TaskClaimed {
        task_id: String,
        claim: String,
    },
    AgentSpawned {
        role: AgentRole,
        task_id: Option<String>,
        worktree: PathBuf,
    },
    AgentFinished {
        role: AgentRole,
        task_id: Option<String>,
        status: AgentStatus,
        exit_code: Option<i32>,
        duration_ms: u64,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskRetry {
        task_id: String,
        fresh_worktree: bool,
        attempt: u32,
    },
    TaskExhausted {
        task_id: String,
    },
    MaintenanceTriggered {
        seq: u32,
        watermark: u64,
        coalesced: bool,
    },
    JudgeVerdict {
        iteration: u32,
        verdict: JudgeVerdict,
    },
    TasksMaterialized {
        iteration: u32,
        count: usize,
    },
    RunCompleted {
        target_branch: String,
    },
    RunFailed {
        reason: String,
    },
    Interrupted,
}

/// A logged event with its timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

/// Serialized appender over the run's event log file.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    writer: Mutex<File>,
}

impl EventLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open event log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. One write in flight at a time.
    pub fn append(&self, event: Event) -> Result<()> {
        let entry = Entry {
            at: Utc::now(),
            event,
        };
        let mut line = serde_json::to_string(&entry).context("serialize event")?;
        line.push('\n');
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("event log writer poisoned"))?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("append event to {}", self.path.display()))?;
        writer
            .flush()
            .with_context(|| format!("flush event log {}", self.path.display()))?;
        debug!(entry = %line.trim_end(), "event appended");
        Ok(())
    }
}

/// Read every entry in append order (status reporting).
pub fn read_entries(path: &Path) -> Result<Vec<Entry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("open event log {}", path.display()))?;
    let mut entries = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read event log {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: Entry = serde_json::from_str(&line)
            .with_context(|| format!("parse event log line {} of {}", idx + 1, path.display()))?;
        entries.push(entry);
    }
    Ok(entries)
}
