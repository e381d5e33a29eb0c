//! Implement phase: continuous task assignment over a bounded agent pool,
//! with concurrent maintenance runs.
//!
//! The control thread is the only scheduler: it refreshes tasks from the
//! store, fills free slots, and blocks on exit notifications from the worker
//! threads (each of which blocks on one child process). Worker threads never
//! touch the store, the scheduler, or the checkpoint.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::graph::{DepGraph, build_graph, detect_cycles};
use crate::core::schedule::{
    AttemptOutcome, Deadlock, RetryMode, classify_attempt, classify_deadlock, next_task,
};
use crate::core::types::{AgentResult, AgentRole, AgentStatus, TaskRecord, TaskStatus};
use crate::io::checkpoint::{ClaimToken, MaintenanceRun, WorktreeRef};
use crate::io::event_log::Event;
use crate::io::worktree::Worktree;
use crate::prompt;
use crate::run::{InterruptedError, Orchestrator, interrupted};

/// The dependency graph contains cycles; scheduling must not proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub cycles: Vec<Vec<String>>,
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self.cycles.iter().map(|c| c.join(" -> ")).collect();
        write!(f, "dependency cycles detected: {}", rendered.join("; "))
    }
}

impl std::error::Error for CycleError {}

/// Open tasks remain but none can ever be assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockError {
    pub deadlocks: Vec<Deadlock>,
}

impl std::fmt::Display for DeadlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        for deadlock in &self.deadlocks {
            match deadlock {
                Deadlock::OutOfScopeBlocker { task_id, blockers } => parts.push(format!(
                    "{task_id} blocked only by out-of-scope task(s) {}",
                    blockers.join(", ")
                )),
                Deadlock::FailedBlocker { task_id, blockers } => parts.push(format!(
                    "{task_id} blocked by permanently failed task(s) {}",
                    blockers.join(", ")
                )),
            }
        }
        write!(f, "scheduling deadlock: {}", parts.join("; "))
    }
}

impl std::error::Error for DeadlockError {}

/// Exit notification from a worker thread.
enum WorkerExit {
    Agent {
        task_id: String,
        attempt: u32,
        worktree: Worktree,
        result: Result<AgentResult>,
    },
    Maintenance {
        seq: u32,
        worktree: Worktree,
        result: Result<AgentResult>,
    },
}

struct ActiveAgent {
    handle: JoinHandle<()>,
}

/// Pool state owned by the control thread for one implement phase.
struct Pool {
    active: HashMap<String, ActiveAgent>,
    maintenance: Option<(u32, ActiveAgent)>,
    /// A maintenance trigger arrived while one was running; triggers
    /// coalesce instead of queueing.
    maintenance_pending: bool,
    /// Tail of the last incomplete attempt per task, fed back into the
    /// retry prompt. In-memory only.
    retry_context: HashMap<String, String>,
}

/// Run the implement phase until every in-scope task and pending maintenance
/// run is terminal.
#[instrument(skip_all, fields(run_id = %o.checkpoint.run.run_id, iteration = o.checkpoint.run.iteration))]
pub fn run(o: &mut Orchestrator) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let mut pool = Pool {
        active: HashMap::new(),
        maintenance: None,
        maintenance_pending: false,
        retry_context: HashMap::new(),
    };

    loop {
        if interrupted() {
            return shutdown_on_interrupt(o, pool);
        }
        o.tick()?;

        // Agents close tasks and file observations from their own worktrees;
        // pull the store so this round's view includes them. Status updates
        // are eventually consistent on the order of seconds, which is fine:
        // the checkpoint, not the store, is scheduling truth.
        o.store.sync()?;
        let tasks = o.store.list_by_label(&o.run_label())?;
        let graph = build_graph(&tasks);
        let cycles = detect_cycles(&graph);
        if !cycles.is_empty() {
            // Hard failure before (and between) any scheduling decision.
            return Err(CycleError { cycles }.into());
        }

        record_closed_tasks(o, &tasks)?;
        fill_agent_slots(o, &mut pool, &graph, &tasks, &tx)?;
        // End-of-batch: every task terminal and no coding agent left. Any
        // completions not yet covered by a maintenance run still owe one.
        let end_of_batch = pool.active.is_empty() && all_tasks_terminal(o, &tasks);
        trigger_maintenance_if_due(o, &mut pool, &tx, end_of_batch)?;

        if phase_complete(o, &pool, &tasks) {
            info!("implement phase complete");
            return Ok(());
        }

        if pool.active.is_empty() && pool.maintenance.is_none() && !pool.maintenance_pending {
            // Nothing running, nothing assignable, work remains: classify.
            let deadlocks = classify_deadlock(&graph, &tasks);
            if !deadlocks.is_empty() {
                return Err(DeadlockError { deadlocks }.into());
            }
            // No deadlock, yet nothing to do: a task is in_progress in the
            // store with no live agent (e.g. left over from a crash that
            // resume already reconciled). Surface it rather than spin.
            return Err(anyhow!(
                "scheduler stalled: no runnable task, no active agent, work remaining"
            ));
        }

        let heartbeat = Duration::from_secs(o.config.heartbeat_secs);
        match rx.recv_timeout(heartbeat) {
            Ok(exit) => {
                if interrupted() {
                    // Exits forced by the interrupt cascade are not retry
                    // material; shut down instead of classifying them.
                    return shutdown_on_interrupt(o, pool);
                }
                reconcile(o, &mut pool, exit)?;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("worker channel closed unexpectedly"));
            }
        }
    }
}

/// Tasks the store now shows closed that we had not recorded yet (agents are
/// the sole writers of the closed transition).
fn record_closed_tasks(o: &mut Orchestrator, tasks: &[TaskRecord]) -> Result<()> {
    for task in tasks {
        if task.status == TaskStatus::Closed && !o.checkpoint.completed.contains(&task.id) {
            o.checkpoint.completed.insert(task.id.clone());
            o.commit_event(Event::TaskCompleted {
                task_id: task.id.clone(),
            })?;
        }
    }
    Ok(())
}

fn fill_agent_slots(
    o: &mut Orchestrator,
    pool: &mut Pool,
    graph: &DepGraph,
    tasks: &[TaskRecord],
    tx: &Sender<WorkerExit>,
) -> Result<()> {
    while pool.active.len() < o.config.concurrency {
        let mut claimed: std::collections::BTreeSet<String> =
            pool.active.keys().cloned().collect();
        claimed.extend(o.checkpoint.permanently_blocked.iter().cloned());
        let Some(task) = next_task(graph, tasks, &claimed) else {
            return Ok(());
        };
        let task = task.clone();
        assign(o, pool, &task, tx)?;
    }
    Ok(())
}

/// Claim a task and spawn a coding agent for it.
///
/// Claim-before-spawn ordering: the claim token and checkpoint land on disk
/// before the process exists, so a crash between the two leaves a token
/// whose dead pid marks the attempt incomplete.
fn assign(o: &mut Orchestrator, pool: &mut Pool, task: &TaskRecord, tx: &Sender<WorkerExit>) -> Result<()> {
    let counters = o.checkpoint.retries.get(&task.id).copied().unwrap_or_default();
    let attempt = counters.fresh + counters.reuse + 1;

    let claim = ClaimToken {
        task_id: task.id.clone(),
        iteration: o.checkpoint.run.iteration,
        attempt,
        pid: Some(std::process::id()),
    };
    let rendered = claim.render(&o.checkpoint.run.run_id);
    o.store.update_status(&task.id, TaskStatus::InProgress)?;
    o.checkpoint.claims.insert(task.id.clone(), claim);
    o.commit_event(Event::TaskClaimed {
        task_id: task.id.clone(),
        claim: rendered,
    })?;

    let worktree = worktree_for_attempt(o, &task.id, attempt)?;
    o.checkpoint.last_worktrees.insert(
        task.id.clone(),
        WorktreeRef {
            path: worktree.path.clone(),
            branch: worktree.branch.clone(),
        },
    );

    let history = pool.retry_context.get(&task.id).cloned();
    let prompt = prompt::task(&prompt::TaskPromptInputs {
        task,
        target_branch: &o.checkpoint.run.target_branch,
        tracker_command: &o.config.tracker_command,
        observation_label: &o.observation_label(),
        history: history.as_deref(),
    })?;

    o.commit_event(Event::AgentSpawned {
        role: AgentRole::Task,
        task_id: Some(task.id.clone()),
        worktree: worktree.path.clone(),
    })?;

    let request = crate::backend::SpawnRequest {
        workdir: worktree.path.clone(),
        prompt,
        system_prompt: None,
        timeout: Duration::from_secs(o.config.agent_timeout_secs),
        env: Vec::new(),
        tail_lines: o.config.tail_lines,
        scratch_dir: o.paths.scratch.join(format!("task-{}-a{attempt}", task.id)),
    };
    let backend = o.agent_backend.clone();
    let tx = tx.clone();
    let task_id = task.id.clone();
    let thread_worktree = worktree.clone();
    let handle = std::thread::spawn(move || {
        let result = backend.spawn(&request);
        let _ = tx.send(WorkerExit::Agent {
            task_id,
            attempt,
            worktree: thread_worktree,
            result,
        });
    });
    pool.active.insert(task.id.clone(), ActiveAgent { handle });
    info!(task_id = %task.id, attempt, "agent assigned");
    Ok(())
}

/// Fresh worktree for a first attempt or a timeout/crash retry; the previous
/// worktree for an incomplete retry, when it still exists.
fn worktree_for_attempt(o: &mut Orchestrator, task_id: &str, attempt: u32) -> Result<Worktree> {
    let counters = o.checkpoint.retries.get(task_id).copied().unwrap_or_default();
    if counters.reuse > 0
        && let Some(previous) = o.checkpoint.last_worktrees.get(task_id)
        && previous.path.exists()
    {
        debug!(task_id, path = %previous.path.display(), "reusing worktree");
        return Ok(Worktree {
            path: previous.path.clone(),
            branch: previous.branch.clone(),
        });
    }
    o.worktrees
        .agent_worktree(task_id, attempt, &o.checkpoint.run.target_branch)
}

fn trigger_maintenance_if_due(
    o: &mut Orchestrator,
    pool: &mut Pool,
    tx: &Sender<WorkerExit>,
    end_of_batch: bool,
) -> Result<()> {
    let completed = o.checkpoint.completed.len() as u64;
    let last_watermark = o
        .checkpoint
        .maintenance
        .last()
        .map(|m| m.watermark)
        .unwrap_or(0);
    let due = completed >= last_watermark + o.config.maintenance_every
        || (end_of_batch && completed > last_watermark);

    if due && pool.maintenance.is_some() {
        if !pool.maintenance_pending {
            // Coalesce: the in-flight run will address breakage accumulated
            // so far; remember that one more is owed, not how many.
            pool.maintenance_pending = true;
            debug!(completed, "maintenance trigger coalesced");
        }
        return Ok(());
    }

    let fire = (due || pool.maintenance_pending) && pool.maintenance.is_none();
    if !fire {
        return Ok(());
    }
    let coalesced = pool.maintenance_pending && !due;
    pool.maintenance_pending = false;

    let seq = o.checkpoint.maintenance.last().map(|m| m.seq + 1).unwrap_or(1);
    o.checkpoint.maintenance.push(MaintenanceRun {
        seq,
        watermark: completed,
        terminal: false,
    });
    o.commit_event(Event::MaintenanceTriggered {
        seq,
        watermark: completed,
        coalesced,
    })?;

    // Always a fresh worktree, regardless of whether checks currently pass.
    let worktree = o
        .worktrees
        .maintenance_worktree(seq, &o.checkpoint.run.target_branch)?;
    let prompt = prompt::maintenance(
        &o.checkpoint.run.target_branch,
        &o.config.tracker_command,
        &o.observation_label(),
    )?;
    o.commit_event(Event::AgentSpawned {
        role: AgentRole::Maintenance,
        task_id: None,
        worktree: worktree.path.clone(),
    })?;

    let request = crate::backend::SpawnRequest {
        workdir: worktree.path.clone(),
        prompt,
        system_prompt: None,
        timeout: Duration::from_secs(o.config.agent_timeout_secs),
        env: Vec::new(),
        tail_lines: o.config.tail_lines,
        scratch_dir: o.paths.scratch.join(format!("maint-{seq}")),
    };
    let backend = o.agent_backend.clone();
    let tx = tx.clone();
    let thread_worktree = worktree.clone();
    let handle = std::thread::spawn(move || {
        let result = backend.spawn(&request);
        let _ = tx.send(WorkerExit::Maintenance {
            seq,
            worktree: thread_worktree,
            result,
        });
    });
    pool.maintenance = Some((seq, ActiveAgent { handle }));
    info!(seq, completed, "maintenance agent spawned");
    Ok(())
}

fn all_tasks_terminal(o: &Orchestrator, tasks: &[TaskRecord]) -> bool {
    !tasks.is_empty()
        && tasks.iter().all(|t| {
            t.status.is_terminal() || o.checkpoint.permanently_blocked.contains(&t.id)
        })
}

/// The judge watermark barrier: every in-scope task terminal, every
/// triggered maintenance run terminal, no maintenance owed for the final
/// completion count, and no agents active.
fn phase_complete(o: &Orchestrator, pool: &Pool, tasks: &[TaskRecord]) -> bool {
    if !pool.active.is_empty() || pool.maintenance.is_some() || pool.maintenance_pending {
        return false;
    }
    if !all_tasks_terminal(o, tasks) {
        return false;
    }
    if !o.checkpoint.maintenance.iter().all(|m| m.terminal) {
        return false;
    }
    let completed = o.checkpoint.completed.len() as u64;
    let last_watermark = o
        .checkpoint
        .maintenance
        .last()
        .map(|m| m.watermark)
        .unwrap_or(0);
    // No maintenance owed for the final completion count.
    completed == last_watermark || completed == 0
}

fn reconcile(o: &mut Orchestrator, pool: &mut Pool, exit: WorkerExit) -> Result<()> {
    match exit {
        WorkerExit::Agent {
            task_id,
            attempt,
            worktree,
            result,
        } => {
            if let Some(agent) = pool.active.remove(&task_id) {
                let _ = agent.handle.join();
            }
            let result = result.with_context(|| format!("agent for {task_id}"))?;
            o.commit_event(Event::AgentFinished {
                role: AgentRole::Task,
                task_id: Some(task_id.clone()),
                status: result.status,
                exit_code: result.exit_code,
                duration_ms: result.duration_ms,
            })?;
            reconcile_task(o, pool, &task_id, attempt, worktree, result)
        }
        WorkerExit::Maintenance {
            seq,
            worktree,
            result,
        } => {
            if let Some((_, agent)) = pool.maintenance.take() {
                let _ = agent.handle.join();
            }
            let result = result.with_context(|| format!("maintenance run {seq}"))?;
            o.commit_event(Event::AgentFinished {
                role: AgentRole::Maintenance,
                task_id: None,
                status: result.status,
                exit_code: result.exit_code,
                duration_ms: result.duration_ms,
            })?;
            if result.status != AgentStatus::Success {
                // Maintenance failures are absorbed: the next trigger gets a
                // fresh worktree and a fresh look at the breakage.
                warn!(seq, status = ?result.status, "maintenance run did not succeed");
            }
            if let Some(run) = o.checkpoint.maintenance.iter_mut().find(|m| m.seq == seq) {
                run.terminal = true;
            }
            o.worktrees.remove(&worktree)?;
            o.save_checkpoint()?;
            Ok(())
        }
    }
}

/// Reconcile the agent's process result against the task's actual state.
fn reconcile_task(
    o: &mut Orchestrator,
    pool: &mut Pool,
    task_id: &str,
    attempt: u32,
    worktree: Worktree,
    result: AgentResult,
) -> Result<()> {
    let task_closed = o
        .store
        .get(task_id)?
        .map(|t| t.status == TaskStatus::Closed)
        .unwrap_or(false);

    match classify_attempt(&result, task_closed) {
        AttemptOutcome::Done => {
            o.checkpoint.claims.remove(task_id);
            o.checkpoint.last_worktrees.remove(task_id);
            pool.retry_context.remove(task_id);
            if o.checkpoint.completed.insert(task_id.to_string()) {
                o.commit_event(Event::TaskCompleted {
                    task_id: task_id.to_string(),
                })?;
            } else {
                o.save_checkpoint()?;
            }
            o.worktrees.remove(&worktree)?;
            info!(task_id, attempt, "task completed");
            Ok(())
        }
        AttemptOutcome::Retry(mode) => retry_task(o, pool, task_id, attempt, worktree, result, mode),
    }
}

fn retry_task(
    o: &mut Orchestrator,
    pool: &mut Pool,
    task_id: &str,
    attempt: u32,
    worktree: Worktree,
    result: AgentResult,
    mode: RetryMode,
) -> Result<()> {
    let mut counters = o.checkpoint.retries.get(task_id).copied().unwrap_or_default();
    let (budget, fresh) = match mode {
        RetryMode::FreshWorktree => {
            counters.fresh += 1;
            (o.config.max_fresh_retries, true)
        }
        RetryMode::ReuseWorktree => {
            counters.reuse += 1;
            (o.config.max_reuse_retries, false)
        }
    };
    let used = if fresh { counters.fresh } else { counters.reuse };
    o.checkpoint.retries.insert(task_id.to_string(), counters);
    o.checkpoint.claims.remove(task_id);

    if fresh {
        // Prior state is suspect; destroy it. The retry gets a new path.
        o.worktrees.remove(&worktree)?;
        o.checkpoint.last_worktrees.remove(task_id);
        pool.retry_context.remove(task_id);
    } else {
        // The agent plausibly made real progress; keep its worktree and feed
        // the tail back into the next prompt.
        pool.retry_context
            .insert(task_id.to_string(), result.tail.join("\n"));
    }

    if used > budget {
        o.store.update_status(task_id, TaskStatus::Blocked)?;
        o.checkpoint.permanently_blocked.insert(task_id.to_string());
        o.commit_event(Event::TaskExhausted {
            task_id: task_id.to_string(),
        })?;
        warn!(task_id, attempt, ?mode, "retry budget exhausted; task blocked");
        return Ok(());
    }

    o.store.update_status(task_id, TaskStatus::Open)?;
    o.commit_event(Event::TaskRetry {
        task_id: task_id.to_string(),
        fresh_worktree: fresh,
        attempt: attempt + 1,
    })?;
    debug!(task_id, next_attempt = attempt + 1, ?mode, "task scheduled for retry");
    Ok(())
}

/// Interrupt: the handler already signalled every process group; drain the
/// pool, write a final checkpoint, and leave worktrees on disk: an agent
/// may hold uncommitted progress worth recovering by hand.
fn shutdown_on_interrupt(o: &mut Orchestrator, pool: Pool) -> Result<()> {
    warn!("interrupt received; draining agent pool");
    for (_, agent) in pool.active {
        let _ = agent.handle.join();
    }
    if let Some((_, agent)) = pool.maintenance {
        let _ = agent.handle.join();
    }
    // Claims stay in the checkpoint: their recorded pid dies with this
    // process, which is exactly what resume uses to mark the attempts
    // incomplete and retry them.
    o.commit_event(Event::Interrupted)?;
    Err(InterruptedError.into())
}
