//! End-to-end orchestration scenarios over scripted backends and an
//! in-memory task store, against a real git repository fixture.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conductor::core::types::{
    AgentResult, AgentStatus, JudgeResult, JudgeVerdict, RemediationTask, RunPhase, TaskStatus,
};
use conductor::io::checkpoint::Checkpoint;
use conductor::io::config::Config;
use conductor::io::lock::RunLock;
use conductor::io::run_dir::RunPaths;
use conductor::io::store::TaskStore;
use conductor::run::{IterationCapError, Orchestrator};
use conductor::test_support::{
    MemoryStore, ScriptedAgentBackend, ScriptedJudgeBackend, TestRepo, success_result, task,
    timeout_result,
};
use conductor::freeze;

/// Extract the task id from a coding-agent prompt (`- id: <task>` line).
fn task_id_of(prompt: &str) -> Option<String> {
    prompt
        .lines()
        .find_map(|line| line.trim().strip_prefix("- id: "))
        .map(str::to_string)
}

struct Fixture {
    repo: TestRepo,
    state_root: PathBuf,
    store: MemoryStore,
    spec_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let repo = TestRepo::new().expect("repo");
        let state_root = repo.scratch("state");
        let spec_path = repo.scratch("spec.md");
        std::fs::write(&spec_path, "# sample spec\n\nbuild the thing\n").expect("write spec");
        Self {
            repo,
            state_root,
            store: MemoryStore::new(),
            spec_path,
        }
    }

    fn config(&self) -> Config {
        Config {
            concurrency: 2,
            agent_timeout_secs: 30,
            judge_timeout_secs: 30,
            heartbeat_secs: 1,
            lock_stale_secs: 60,
            state_root: self.state_root.display().to_string(),
            ..Config::default()
        }
    }

    /// Seed `count` independent open tasks labeled `seed`.
    fn seed_tasks(&self, count: usize) {
        for i in 1..=count {
            let mut record = task(&format!("t-{i}"), TaskStatus::Open, &[]);
            record.labels = vec!["seed".to_string()];
            self.store.insert(record);
        }
    }

    fn orchestrator(
        &self,
        config: Config,
        agent: ScriptedAgentBackend,
        judge: ScriptedJudgeBackend,
    ) -> Orchestrator {
        let run_record = freeze::prepare(&self.state_root, &self.spec_path, "main", false)
            .expect("prepare");
        let paths = RunPaths::new(&self.state_root, &run_record.run_id);
        paths.ensure_dirs().expect("dirs");
        let lock = RunLock::acquire(&paths.lock, &run_record.run_id, Duration::from_secs(60))
            .expect("lock");
        Orchestrator::with_parts(
            config,
            paths,
            self.repo.root().to_path_buf(),
            Box::new(self.store.clone()),
            Arc::new(agent),
            Box::new(judge),
            Checkpoint::new(run_record),
            lock,
            Some("seed".to_string()),
        )
        .expect("orchestrator")
    }
}

/// Standard scripted handler: acceptance prompts write the criteria file,
/// task prompts close their task, maintenance prompts succeed.
fn standard_agent(store: MemoryStore) -> ScriptedAgentBackend {
    ScriptedAgentBackend::new(move |request| {
        if request.prompt.contains("Acceptance Criteria Author") {
            std::fs::write(request.workdir.join("acceptance.md"), "1. builds\n")?;
            return Ok(success_result());
        }
        if let Some(task_id) = task_id_of(&request.prompt) {
            store.agent_close(&task_id);
        }
        Ok(success_result())
    })
}

fn pass_verdict() -> JudgeResult {
    JudgeResult {
        verdict: JudgeVerdict::Pass,
        summary: "all criteria pass".to_string(),
        drift_findings: Vec::new(),
        criteria: Vec::new(),
        triage: Vec::new(),
        remediation: Vec::new(),
    }
}

/// Full pipeline: freeze, adopt, implement, end-of-batch maintenance, judge
/// pass, completed.
#[test]
fn pipeline_completes_on_passing_verdict() {
    let fixture = Fixture::new();
    fixture.seed_tasks(3);

    let mut orchestrator = fixture.orchestrator(
        fixture.config(),
        standard_agent(fixture.store.clone()),
        ScriptedJudgeBackend::new(vec![pass_verdict()]),
    );

    let phase = orchestrator.drive().expect("drive");
    assert_eq!(phase, RunPhase::Completed);
    assert_eq!(orchestrator.checkpoint.completed.len(), 3);
    assert!(orchestrator.checkpoint.claims.is_empty());
    // End-of-batch maintenance ran and finished.
    assert_eq!(orchestrator.checkpoint.maintenance.len(), 1);
    assert!(orchestrator.checkpoint.maintenance[0].terminal);
    // Acceptance criteria landed outside the repository worktrees.
    assert!(orchestrator.checkpoint.run.acceptance_path.exists());
    // The verdict for iteration 1 is on disk.
    assert!(orchestrator.paths.verdict(1).exists());
    orchestrator.finish().expect("release lock");
}

/// Scenario A: three independent tasks under concurrency 2 never run more
/// than two agents at once, and all three complete.
#[test]
fn concurrency_is_bounded_by_the_pool() {
    let fixture = Fixture::new();
    fixture.seed_tasks(3);

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let store = fixture.store.clone();
    let agent = {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        ScriptedAgentBackend::new(move |request| {
            if request.prompt.contains("Acceptance Criteria Author") {
                std::fs::write(request.workdir.join("acceptance.md"), "1. builds\n")?;
                return Ok(success_result());
            }
            let Some(task_id) = task_id_of(&request.prompt) else {
                return Ok(success_result());
            };
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(150));
            store.agent_close(&task_id);
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(success_result())
        })
    };

    let mut orchestrator = fixture.orchestrator(
        fixture.config(),
        agent,
        ScriptedJudgeBackend::new(vec![pass_verdict()]),
    );
    orchestrator.drive().expect("drive");

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(orchestrator.checkpoint.completed.len(), 3);
}

/// Retry-mode property: a timeout retries in a fresh worktree (different
/// path), while a clean-exit-but-not-closed attempt reuses its worktree.
#[test]
fn retry_modes_pick_the_right_worktree() {
    let fixture = Fixture::new();
    // Two tasks: "t-1" times out once, "t-2" exits clean without closing.
    fixture.seed_tasks(2);

    let workdirs: Arc<Mutex<Vec<(String, PathBuf)>>> = Arc::new(Mutex::new(Vec::new()));
    let attempts = Arc::new(AtomicUsize::new(0));
    let store = fixture.store.clone();
    let agent = {
        let workdirs = Arc::clone(&workdirs);
        let attempts = Arc::clone(&attempts);
        ScriptedAgentBackend::new(move |request| {
            if request.prompt.contains("Acceptance Criteria Author") {
                std::fs::write(request.workdir.join("acceptance.md"), "1. builds\n")?;
                return Ok(success_result());
            }
            let Some(task_id) = task_id_of(&request.prompt) else {
                return Ok(success_result());
            };
            workdirs
                .lock()
                .expect("lock")
                .push((task_id.clone(), request.workdir.clone()));
            let seen_before = workdirs
                .lock()
                .expect("lock")
                .iter()
                .filter(|(id, _)| *id == task_id)
                .count()
                > 1;
            attempts.fetch_add(1, Ordering::SeqCst);
            if seen_before {
                // Second attempt completes.
                store.agent_close(&task_id);
                return Ok(success_result());
            }
            match task_id.as_str() {
                "t-1" => Ok(timeout_result()),
                // Clean exit, task left open: the "incomplete" class.
                _ => Ok(success_result()),
            }
        })
    };

    let mut config = fixture.config();
    config.concurrency = 1;
    let mut orchestrator = fixture.orchestrator(
        config,
        agent,
        ScriptedJudgeBackend::new(vec![pass_verdict()]),
    );
    orchestrator.drive().expect("drive");

    let workdirs = workdirs.lock().expect("lock");
    let paths_for = |id: &str| -> Vec<&PathBuf> {
        workdirs
            .iter()
            .filter(|(task_id, _)| task_id == id)
            .map(|(_, path)| path)
            .collect()
    };

    let timeout_paths = paths_for("t-1");
    assert_eq!(timeout_paths.len(), 2);
    assert_ne!(timeout_paths[0], timeout_paths[1], "timeout retries must start fresh");

    let incomplete_paths = paths_for("t-2");
    assert_eq!(incomplete_paths.len(), 2);
    assert_eq!(
        incomplete_paths[0], incomplete_paths[1],
        "incomplete retries must reuse the worktree"
    );
}

/// Scenario B at the pipeline level: a dependency edge stored on the blocker
/// delays the dependent until the blocker closes.
#[test]
fn blocked_task_waits_for_its_blocker() {
    let fixture = Fixture::new();
    let mut blocker = task("t-1", TaskStatus::Open, &["t-2"]);
    blocker.labels = vec!["seed".to_string()];
    fixture.store.insert(blocker);
    let mut blocked = task("t-2", TaskStatus::Open, &[]);
    blocked.labels = vec!["seed".to_string()];
    fixture.store.insert(blocked);

    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let store = fixture.store.clone();
    let agent = {
        let order = Arc::clone(&order);
        ScriptedAgentBackend::new(move |request| {
            if request.prompt.contains("Acceptance Criteria Author") {
                std::fs::write(request.workdir.join("acceptance.md"), "1. builds\n")?;
                return Ok(success_result());
            }
            if let Some(task_id) = task_id_of(&request.prompt) {
                order.lock().expect("lock").push(task_id.clone());
                store.agent_close(&task_id);
            }
            Ok(success_result())
        })
    };

    let mut orchestrator = fixture.orchestrator(
        fixture.config(),
        agent,
        ScriptedJudgeBackend::new(vec![pass_verdict()]),
    );
    orchestrator.drive().expect("drive");

    let order = order.lock().expect("lock");
    assert_eq!(*order, vec!["t-1".to_string(), "t-2".to_string()]);
}

/// Scenario C at the pipeline level: a failed evaluation is a failed
/// iteration bounded by the cap, not a crash.
#[test]
fn failed_evaluations_hit_the_iteration_cap() {
    let fixture = Fixture::new();
    fixture.seed_tasks(1);

    let mut config = fixture.config();
    config.max_iterations = 2;
    let judge = ScriptedJudgeBackend::new(vec![
        JudgeResult::evaluation_error("findings pass timed out"),
        JudgeResult::evaluation_error("findings pass timed out"),
    ]);
    let mut orchestrator =
        fixture.orchestrator(config, standard_agent(fixture.store.clone()), judge);

    let err = orchestrator.drive().expect_err("must hit the cap");
    let cap = err
        .downcast_ref::<IterationCapError>()
        .expect("iteration cap error");
    assert_eq!(cap.iterations, 2);
    assert_eq!(orchestrator.checkpoint.run.phase, RunPhase::Failed);
    // Both evaluation attempts left verdict records.
    assert!(orchestrator.paths.verdict(1).exists());
    assert!(orchestrator.paths.verdict(2).exists());
}

/// A failing verdict materializes remediation tasks (with dependency edges)
/// and the next iteration implements them.
#[test]
fn failing_verdict_materializes_remediation_tasks() {
    let fixture = Fixture::new();
    fixture.seed_tasks(1);

    let fail_verdict = JudgeResult {
        verdict: JudgeVerdict::Fail,
        summary: "missing error handling".to_string(),
        drift_findings: Vec::new(),
        criteria: Vec::new(),
        triage: Vec::new(),
        remediation: vec![
            RemediationTask {
                title: "add error types".to_string(),
                description: "shared error enum".to_string(),
                depends_on: Vec::new(),
            },
            RemediationTask {
                title: "propagate errors".to_string(),
                description: "use the new types".to_string(),
                depends_on: vec!["add error types".to_string()],
            },
        ],
    };
    let judge = ScriptedJudgeBackend::new(vec![fail_verdict, pass_verdict()]);
    let mut orchestrator =
        fixture.orchestrator(fixture.config(), standard_agent(fixture.store.clone()), judge);

    let phase = orchestrator.drive().expect("drive");
    assert_eq!(phase, RunPhase::Completed);
    assert_eq!(orchestrator.checkpoint.run.iteration, 2);
    // 1 seeded + 2 remediation tasks, all completed.
    assert_eq!(orchestrator.checkpoint.completed.len(), 3);
    assert_eq!(fixture.store.task_count(), 3);
}

/// Exhausted retry budgets mark the task permanently blocked and the run
/// fails on the resulting deadlock instead of retrying forever.
#[test]
fn exhausted_retries_block_the_task() {
    let fixture = Fixture::new();
    fixture.seed_tasks(1);

    let agent = ScriptedAgentBackend::new(move |request| {
        if request.prompt.contains("Acceptance Criteria Author") {
            std::fs::write(request.workdir.join("acceptance.md"), "1. builds\n")?;
            return Ok(success_result());
        }
        // Every coding attempt times out.
        Ok(timeout_result())
    });

    let mut config = fixture.config();
    config.concurrency = 1;
    config.max_fresh_retries = 1;
    let mut orchestrator =
        fixture.orchestrator(config, agent, ScriptedJudgeBackend::new(vec![pass_verdict()]));

    // The lone task becomes permanently blocked; with nothing left to judge
    // against a closed task set, implement completes and the judge still
    // runs, but the store shows the block.
    let _ = orchestrator.drive();
    assert_eq!(
        fixture.store.status_of("t-1"),
        Some(TaskStatus::Blocked),
        "task must be marked blocked after the budget is spent"
    );
    assert!(orchestrator.checkpoint.permanently_blocked.contains("t-1"));
}

/// Crash/resume: a claim whose process died is reopened as a retryable
/// incomplete attempt.
#[test]
fn resume_reconciles_dead_claims() {
    let fixture = Fixture::new();
    fixture.seed_tasks(1);
    fixture
        .store
        .update_status("t-1", TaskStatus::InProgress)
        .expect("status");

    let run_record =
        freeze::prepare(&fixture.state_root, &fixture.spec_path, "main", false).expect("prepare");
    let label = format!("conductor/{}", run_record.run_id);
    fixture.store.add_label("t-1", &label).expect("label");

    let paths = RunPaths::new(&fixture.state_root, &run_record.run_id);
    paths.ensure_dirs().expect("dirs");
    std::fs::copy(&fixture.spec_path, &run_record.frozen_spec_path).expect("freeze");
    std::fs::write(&run_record.acceptance_path, "1. builds\n").expect("acceptance");

    let mut checkpoint = Checkpoint::new(run_record.clone());
    checkpoint.run.phase = RunPhase::Implement;
    checkpoint.claims.insert(
        "t-1".to_string(),
        conductor::io::checkpoint::ClaimToken {
            task_id: "t-1".to_string(),
            iteration: 1,
            attempt: 1,
            // An implausibly large pid: no such process.
            pid: Some(4_000_000),
        },
    );

    let lock = RunLock::acquire(&paths.lock, &run_record.run_id, Duration::from_secs(60))
        .expect("lock");
    let mut orchestrator = Orchestrator::with_parts(
        fixture.config(),
        paths,
        fixture.repo.root().to_path_buf(),
        Box::new(fixture.store.clone()),
        Arc::new(standard_agent(fixture.store.clone())),
        Box::new(ScriptedJudgeBackend::new(vec![pass_verdict()])),
        checkpoint,
        lock,
        None,
    )
    .expect("orchestrator");

    // `Orchestrator::resume` builds a CLI-backed store, so reconcile through
    // the same method it calls.
    orchestrator.reconcile_claims().expect("reconcile");

    assert_eq!(fixture.store.status_of("t-1"), Some(TaskStatus::Open));
    assert!(orchestrator.checkpoint.claims.is_empty());
    assert_eq!(
        orchestrator
            .checkpoint
            .retries
            .get("t-1")
            .map(|c| c.reuse),
        Some(1)
    );

    let phase = orchestrator.drive().expect("drive");
    assert_eq!(phase, RunPhase::Completed);
}

#[test]
fn agent_results_report_durations() {
    // Sanity on the shared result constructors used across these tests.
    let result: AgentResult = success_result();
    assert_eq!(result.status, AgentStatus::Success);
    assert_eq!(result.exit_code, Some(0));
}
