//! Top-level run driver: the phase state machine and the orchestrator
//! context shared by the phase modules.
//!
//! One orchestrator process owns one run at a time (enforced by the run
//! lock). The control plane is single-threaded: phases execute in sequence
//! on this thread, and only agent worker threads run concurrently with it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::backend::{AgentBackend, JudgeBackend};
use crate::core::types::{RunPhase, TaskStatus};
use crate::io::checkpoint::{self, Checkpoint};
use crate::io::config::Config;
use crate::io::event_log::{Event, EventLog};
use crate::io::lock::RunLock;
use crate::io::process::{TERM_GRACE, process_alive, terminate_all};
use crate::io::run_dir::{RunPaths, latest_run};
use crate::io::store::{CliTaskStore, TaskStore};
use crate::io::worktree::WorktreeManager;
use crate::judge::JudgeOutcome;
use crate::{decompose, freeze, implement, judge};

/// The operator interrupted the run; state is checkpointed, worktrees are
/// left on disk for manual recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptedError;

impl std::fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run interrupted; checkpoint written, worktrees left in place")
    }
}

impl std::error::Error for InterruptedError {}

/// The judge loop hit its iteration cap with work remaining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationCapError {
    pub iterations: u32,
}

impl std::fmt::Display for IterationCapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "iteration cap ({}) reached without a passing verdict; run is partially complete",
            self.iterations
        )
    }
}

impl std::error::Error for IterationCapError {}

/// Resume found no acceptance criteria for a run already past freeze.
///
/// Regenerating them mid-run would move the evaluation target, so this is a
/// hard precondition failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingAcceptanceError {
    pub path: PathBuf,
}

impl std::fmt::Display for MissingAcceptanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "acceptance criteria {} are missing for a run past freeze; refusing to regenerate",
            self.path.display()
        )
    }
}

impl std::error::Error for MissingAcceptanceError {}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// True once the external interrupt handler fired.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Install the process-wide interrupt handler: flag the control thread and
/// cascade termination to every active agent process group.
pub fn install_interrupt_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        warn!("interrupt: terminating active agents");
        INTERRUPTED.store(true, Ordering::SeqCst);
        terminate_all(TERM_GRACE);
    })
    .context("install interrupt handler")
}

/// Options for starting a new run.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub spec_path: PathBuf,
    pub base_branch: String,
    pub integration_branch: bool,
    pub adopt: Option<String>,
    pub repo_root: PathBuf,
}

/// Everything one run needs, owned by the control thread.
pub struct Orchestrator {
    pub config: Config,
    pub paths: RunPaths,
    pub repo_root: PathBuf,
    pub store: Box<dyn TaskStore>,
    pub agent_backend: Arc<dyn AgentBackend>,
    pub judge_backend: Box<dyn JudgeBackend>,
    pub events: EventLog,
    pub checkpoint: Checkpoint,
    pub worktrees: WorktreeManager,
    pub adopt: Option<String>,
    lock: RunLock,
    last_heartbeat: Instant,
}

impl Orchestrator {
    /// Assemble an orchestrator from explicit parts (used by `start`,
    /// `resume`, and test harnesses).
    pub fn with_parts(
        config: Config,
        paths: RunPaths,
        repo_root: PathBuf,
        store: Box<dyn TaskStore>,
        agent_backend: Arc<dyn AgentBackend>,
        judge_backend: Box<dyn JudgeBackend>,
        checkpoint: Checkpoint,
        lock: RunLock,
        adopt: Option<String>,
    ) -> Result<Self> {
        let events = EventLog::open(&paths.event_log)?;
        let worktrees = WorktreeManager::new(
            repo_root.clone(),
            paths.worktrees.clone(),
            checkpoint.run.run_id.clone(),
        );
        Ok(Self {
            config,
            paths,
            repo_root,
            store,
            agent_backend,
            judge_backend,
            events,
            checkpoint,
            worktrees,
            adopt,
            lock,
            last_heartbeat: Instant::now(),
        })
    }

    /// Start a new run from a specification.
    pub fn start(config: Config, options: StartOptions) -> Result<Self> {
        config.validate()?;
        let state_root = config.state_root();
        let run = freeze::prepare(
            &state_root,
            &options.spec_path,
            &options.base_branch,
            options.integration_branch,
        )?;
        let paths = RunPaths::new(&state_root, &run.run_id);
        paths.ensure_dirs()?;
        let lock = RunLock::acquire(
            &paths.lock,
            &run.run_id,
            Duration::from_secs(config.lock_stale_secs),
        )?;
        let kind = crate::backend::detect(&config)?;
        let (agent_backend, judge_backend) = crate::backend::create(kind, &config);
        let store = Box::new(CliTaskStore::new(
            config.tracker_command.clone(),
            options.repo_root.clone(),
        ));
        let checkpoint = Checkpoint::new(run);
        let orchestrator = Self::with_parts(
            config,
            paths,
            options.repo_root,
            store,
            agent_backend,
            judge_backend,
            checkpoint,
            lock,
            options.adopt,
        )?;
        orchestrator.save_checkpoint()?;
        info!(run_id = %orchestrator.checkpoint.run.run_id, "run created");
        Ok(orchestrator)
    }

    /// Resume a run from its checkpoint.
    ///
    /// Identity comes from the checkpoint; operational settings come from
    /// the current configuration so a stuck run can be tuned in place.
    pub fn resume(
        config: Config,
        run_id: Option<String>,
        repo_root: PathBuf,
        adopt: Option<String>,
    ) -> Result<Self> {
        config.validate()?;
        let state_root = config.state_root();
        let run_id = match run_id {
            Some(id) => id,
            None => latest_run(&state_root)?
                .ok_or_else(|| anyhow!("no runs found under {}", state_root.display()))?,
        };
        let paths = RunPaths::new(&state_root, &run_id);
        let checkpoint = checkpoint::load(&paths.checkpoint, &paths.checkpoint_tmp)?;
        // A run that died mid-freeze may not have copied the spec yet; in
        // every other case the frozen copy must exist and hash clean.
        if checkpoint.run.phase != RunPhase::Freeze
            || checkpoint.run.frozen_spec_path.exists()
        {
            checkpoint::verify_spec_hash(
                &checkpoint.run.frozen_spec_path,
                &checkpoint.run.spec_hash,
            )?;
        }
        if checkpoint.run.phase != RunPhase::Freeze
            && !checkpoint.run.acceptance_path.exists()
        {
            return Err(MissingAcceptanceError {
                path: checkpoint.run.acceptance_path.clone(),
            }
            .into());
        }

        let lock = RunLock::acquire(
            &paths.lock,
            &run_id,
            Duration::from_secs(config.lock_stale_secs),
        )?;
        let kind = crate::backend::detect(&config)?;
        let (agent_backend, judge_backend) = crate::backend::create(kind, &config);
        let store = Box::new(CliTaskStore::new(
            config.tracker_command.clone(),
            repo_root.clone(),
        ));
        let mut orchestrator = Self::with_parts(
            config,
            paths,
            repo_root,
            store,
            agent_backend,
            judge_backend,
            checkpoint,
            lock,
            adopt,
        )?;
        orchestrator.reconcile_claims()?;
        info!(run_id = %orchestrator.checkpoint.run.run_id, phase = ?orchestrator.checkpoint.run.phase, "run resumed");
        Ok(orchestrator)
    }

    /// On resume, a claim whose recorded process is no longer alive is an
    /// incomplete attempt, not an abandoned-but-fine one: the task is
    /// reopened and charged a reuse retry so the next attempt continues in
    /// its surviving worktree.
    pub fn reconcile_claims(&mut self) -> Result<()> {
        let stale: Vec<_> = self
            .checkpoint
            .claims
            .values()
            .filter(|claim| !claim.pid.map(|pid| process_alive(pid as i32)).unwrap_or(false))
            .cloned()
            .collect();
        for claim in stale {
            let task_id = claim.task_id.clone();
            self.checkpoint.claims.remove(&task_id);
            let closed = self
                .store
                .get(&task_id)?
                .map(|t| t.status == TaskStatus::Closed)
                .unwrap_or(false);
            if closed {
                // The agent finished and closed the task before the crash.
                self.checkpoint.completed.insert(task_id.clone());
                continue;
            }
            let mut counters = self
                .checkpoint
                .retries
                .get(&task_id)
                .copied()
                .unwrap_or_default();
            counters.reuse += 1;
            self.checkpoint.retries.insert(task_id.clone(), counters);
            self.store.update_status(&task_id, TaskStatus::Open)?;
            warn!(task_id = %task_id, "incomplete attempt from prior process; marked retryable");
        }
        // A maintenance run that never finished owes a fresh trigger.
        self.checkpoint.maintenance.retain(|m| m.terminal);
        self.save_checkpoint()?;
        Ok(())
    }

    /// Label scoping every task of this run.
    pub fn run_label(&self) -> String {
        format!("conductor/{}", self.checkpoint.run.run_id)
    }

    /// Label agents put on out-of-scope findings, triaged by the judge.
    pub fn observation_label(&self) -> String {
        format!("conductor/{}/obs", self.checkpoint.run.run_id)
    }

    /// Refresh the lock heartbeat when due. Cheap to call every round.
    pub fn tick(&mut self) -> Result<()> {
        if self.last_heartbeat.elapsed() >= Duration::from_secs(self.config.heartbeat_secs) {
            self.lock.heartbeat()?;
            self.last_heartbeat = Instant::now();
        }
        Ok(())
    }

    /// Persist the checkpoint.
    pub fn save_checkpoint(&self) -> Result<()> {
        checkpoint::save(
            &self.paths.checkpoint,
            &self.paths.checkpoint_tmp,
            &self.checkpoint,
        )
    }

    /// Persist the checkpoint, then append the event that motivated it.
    ///
    /// Ordering matters: a crash can never show more progress in the event
    /// log than was durably recorded.
    pub fn commit_event(&mut self, event: Event) -> Result<()> {
        self.save_checkpoint()?;
        self.events.append(event)
    }

    fn transition(&mut self, phase: RunPhase) -> Result<()> {
        self.checkpoint.run.phase = phase;
        let iteration = self.checkpoint.run.iteration;
        self.commit_event(Event::PhaseChanged { phase, iteration })
    }

    /// Step the phase state machine to a terminal phase.
    #[instrument(skip_all, fields(run_id = %self.checkpoint.run.run_id))]
    pub fn drive(&mut self) -> Result<RunPhase> {
        loop {
            if interrupted() {
                self.commit_event(Event::Interrupted)?;
                return Err(InterruptedError.into());
            }
            // The frozen spec is the run's fixed target; check it before
            // every transition, not only at resume.
            if self.checkpoint.run.phase != RunPhase::Freeze {
                checkpoint::verify_spec_hash(
                    &self.checkpoint.run.frozen_spec_path,
                    &self.checkpoint.run.spec_hash,
                )?;
            }
            match self.checkpoint.run.phase {
                RunPhase::Freeze => {
                    freeze::run(self)?;
                    self.transition(RunPhase::Decompose)?;
                }
                RunPhase::Decompose => {
                    decompose::run(self)?;
                    self.transition(RunPhase::Implement)?;
                }
                RunPhase::Implement => match implement::run(self) {
                    Ok(()) => self.transition(RunPhase::Judge)?,
                    Err(err) => {
                        if err.downcast_ref::<InterruptedError>().is_none() {
                            self.checkpoint.run.phase = RunPhase::Failed;
                            let _ = self.commit_event(Event::RunFailed {
                                reason: err.to_string(),
                            });
                        }
                        return Err(err);
                    }
                },
                RunPhase::Judge => match judge::run(self)? {
                    JudgeOutcome::Passed => {
                        self.transition(RunPhase::Completed)?;
                        self.commit_event(Event::RunCompleted {
                            target_branch: self.checkpoint.run.target_branch.clone(),
                        })?;
                        return Ok(RunPhase::Completed);
                    }
                    JudgeOutcome::NeedsIteration => {
                        let next = self.checkpoint.run.iteration + 1;
                        if next > self.config.max_iterations {
                            let cap = IterationCapError {
                                iterations: self.config.max_iterations,
                            };
                            self.checkpoint.run.phase = RunPhase::Failed;
                            self.commit_event(Event::RunFailed {
                                reason: cap.to_string(),
                            })?;
                            return Err(cap.into());
                        }
                        self.checkpoint.run.iteration = next;
                        self.transition(RunPhase::Implement)?;
                    }
                },
                RunPhase::Completed => return Ok(RunPhase::Completed),
                RunPhase::Failed => return Ok(RunPhase::Failed),
            }
        }
    }

    /// Release the run lock on clean exit.
    pub fn finish(self) -> Result<()> {
        self.lock.release()
    }
}

/// Repository root for tracker and worktree operations: the current
/// directory's git toplevel.
pub fn discover_repo_root(cwd: &Path) -> Result<PathBuf> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(cwd)
        .output()
        .context("spawn git rev-parse --show-toplevel")?;
    if !output.status.success() {
        return Err(anyhow!(
            "not inside a git repository (run conductor from the project checkout)"
        ));
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(PathBuf::from(path))
}
