//! Test-only fakes: an in-memory task store, scripted backends, and a git
//! repository fixture with a local bare origin.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};

use crate::backend::{AgentBackend, JudgeBackend, JudgeRequest, SpawnRequest};
use crate::core::types::{AgentResult, AgentStatus, JudgeResult, TaskRecord, TaskStatus};
use crate::io::store::{TaskDraft, TaskStore};

/// Deterministic task record with default fields.
pub fn task(id: &str, status: TaskStatus, blocks: &[&str]) -> TaskRecord {
    TaskRecord {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        status,
        priority: 0,
        seq: 0,
        labels: Vec::new(),
        blocks: blocks.iter().map(|s| s.to_string()).collect(),
    }
}

#[derive(Debug, Default)]
struct MemoryStoreState {
    tasks: BTreeMap<String, TaskRecord>,
    next_seq: u64,
}

/// In-memory [`TaskStore`]. Clones share state, so a test can hold a handle
/// while the orchestrator owns another (mirroring the real store, which is
/// shared with the spawned agents).
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryStoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a task, assigning it the next creation sequence number.
    pub fn insert(&self, mut record: TaskRecord) {
        let mut state = self.state.lock().expect("store lock");
        state.next_seq += 1;
        if record.seq == 0 {
            record.seq = state.next_seq;
        }
        state.tasks.insert(record.id.clone(), record);
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.state
            .lock()
            .expect("store lock")
            .tasks
            .get(id)
            .map(|t| t.status)
    }

    pub fn task_count(&self) -> usize {
        self.state.lock().expect("store lock").tasks.len()
    }

    /// Close a task the way a spawned agent would (concurrent writer).
    pub fn agent_close(&self, id: &str) {
        let mut state = self.state.lock().expect("store lock");
        if let Some(task) = state.tasks.get_mut(id) {
            task.status = TaskStatus::Closed;
        }
    }
}

impl TaskStore for MemoryStore {
    fn list_by_label(&self, label: &str) -> Result<Vec<TaskRecord>> {
        let state = self.state.lock().expect("store lock");
        let mut tasks: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| t.has_label(label))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.seq);
        Ok(tasks)
    }

    fn list_open(&self) -> Result<Vec<TaskRecord>> {
        let state = self.state.lock().expect("store lock");
        let mut tasks: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Open)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.seq);
        Ok(tasks)
    }

    fn get(&self, id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.state.lock().expect("store lock").tasks.get(id).cloned())
    }

    fn create(&self, draft: &TaskDraft) -> Result<String> {
        let mut state = self.state.lock().expect("store lock");
        state.next_seq += 1;
        let next_seq = state.next_seq;
        let id = format!("t-{}", state.next_seq);
        state.tasks.insert(
            id.clone(),
            TaskRecord {
                id: id.clone(),
                title: draft.title.clone(),
                description: draft.description.clone(),
                status: TaskStatus::Open,
                priority: draft.priority,
                seq: next_seq,
                labels: draft.labels.clone(),
                blocks: draft.blocks.clone(),
            },
        );
        Ok(id)
    }

    fn update_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let mut state = self.state.lock().expect("store lock");
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown task {id}"))?;
        task.status = status;
        Ok(())
    }

    fn close(&self, id: &str) -> Result<()> {
        self.update_status(id, TaskStatus::Closed)
    }

    fn add_label(&self, id: &str, label: &str) -> Result<()> {
        let mut state = self.state.lock().expect("store lock");
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown task {id}"))?;
        if !task.labels.iter().any(|l| l == label) {
            task.labels.push(label.to_string());
        }
        Ok(())
    }

    fn add_block(&self, blocker: &str, blocked: &str) -> Result<()> {
        let mut state = self.state.lock().expect("store lock");
        let task = state
            .tasks
            .get_mut(blocker)
            .ok_or_else(|| anyhow!("unknown task {blocker}"))?;
        if !task.blocks.iter().any(|b| b == blocked) {
            task.blocks.push(blocked.to_string());
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

type SpawnHandler = dyn Fn(&SpawnRequest) -> Result<AgentResult> + Send + Sync;

/// Agent backend driven by a test-provided handler.
pub struct ScriptedAgentBackend {
    handler: Arc<SpawnHandler>,
}

impl ScriptedAgentBackend {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&SpawnRequest) -> Result<AgentResult> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// Backend whose every spawn succeeds without doing anything.
    pub fn always_succeed() -> Self {
        Self::new(|_| Ok(success_result()))
    }
}

impl AgentBackend for ScriptedAgentBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<AgentResult> {
        (self.handler)(request)
    }
}

/// Judge backend returning pre-scripted results in order.
pub struct ScriptedJudgeBackend {
    results: Mutex<Vec<JudgeResult>>,
}

impl ScriptedJudgeBackend {
    pub fn new(results: Vec<JudgeResult>) -> Self {
        Self {
            results: Mutex::new(results),
        }
    }
}

impl JudgeBackend for ScriptedJudgeBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn evaluate(&self, _request: &JudgeRequest) -> Result<JudgeResult> {
        let mut results = self.results.lock().expect("judge lock");
        if results.is_empty() {
            return Err(anyhow!("scripted judge has no result left"));
        }
        Ok(results.remove(0))
    }
}

pub fn success_result() -> AgentResult {
    AgentResult {
        status: AgentStatus::Success,
        exit_code: Some(0),
        tail: Vec::new(),
        duration_ms: 1,
    }
}

pub fn failure_result() -> AgentResult {
    AgentResult {
        status: AgentStatus::Failure,
        exit_code: Some(1),
        tail: vec!["boom".to_string()],
        duration_ms: 1,
    }
}

pub fn timeout_result() -> AgentResult {
    AgentResult {
        status: AgentStatus::Timeout,
        exit_code: None,
        tail: Vec::new(),
        duration_ms: 1,
    }
}

/// A git repository with an initial commit and a local bare `origin`, both
/// inside one temp directory.
pub struct TestRepo {
    temp: tempfile::TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let origin = temp.path().join("origin.git");
        let root = temp.path().join("repo");
        std::fs::create_dir_all(&root)?;

        git(temp.path(), &["init", "--bare", "-b", "main", "origin.git"])?;
        git(&root, &["init", "-b", "main"])?;
        git(&root, &["config", "user.email", "test@example.com"])?;
        git(&root, &["config", "user.name", "test"])?;
        std::fs::write(root.join("README.md"), "hi\n")?;
        git(&root, &["add", "."])?;
        git(&root, &["commit", "-m", "chore: init"])?;
        git(
            &root,
            &["remote", "add", "origin", origin.display().to_string().as_str()],
        )?;
        git(&root, &["push", "-u", "origin", "main"])?;
        Ok(Self { temp, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch space inside the fixture's temp directory.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.temp.path().join(name)
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .with_context(|| format!("git {args:?}"))?;
    if !status.success() {
        return Err(anyhow!("git {args:?} failed"));
    }
    Ok(())
}
