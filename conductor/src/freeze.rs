//! Freeze phase: pin the specification, derive the run identity, publish the
//! integration branch, and generate acceptance criteria.
//!
//! The acceptance criteria land in the run's state directory, a cache
//! location outside every worktree, and their path is never rendered into a
//! coding agent's prompt or environment, so implementers cannot overfit to
//! the evaluation target.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::types::{AgentRole, AgentStatus, RunPhase};
use crate::io::checkpoint::{RunRecord, hash_bytes};
use crate::io::event_log::Event;
use crate::io::run_dir::RunPaths;
use crate::prompt;
use crate::run::Orchestrator;

/// Derive the run identity from the specification contents.
///
/// Content-derived and collision-resistant: the first 12 hex of a sha256
/// over the spec and base branch, suffix-disambiguated against runs already
/// present under the state root.
pub fn derive_run_id(state_root: &Path, spec_contents: &str, base_branch: &str) -> Result<String> {
    let digest = hash_bytes(format!("{spec_contents}\n{base_branch}").as_bytes());
    let base = format!("run-{}", &digest[..12]);

    for suffix in 1..=999u32 {
        let id = if suffix == 1 {
            base.clone()
        } else {
            format!("{base}-{suffix}")
        };
        if !RunPaths::new(state_root, &id).root.exists() {
            return Ok(id);
        }
    }
    Err(anyhow!(
        "unable to derive unique run id from base '{base}' (too many existing runs)"
    ))
}

/// Build the run record for a new run. Reads the spec; creates nothing.
pub fn prepare(
    state_root: &Path,
    spec_path: &Path,
    base_branch: &str,
    integration_branch: bool,
) -> Result<RunRecord> {
    let contents = fs::read_to_string(spec_path)
        .with_context(|| format!("read specification {}", spec_path.display()))?;
    let run_id = derive_run_id(state_root, &contents, base_branch)?;
    let paths = RunPaths::new(state_root, &run_id);
    let target_branch = if integration_branch {
        format!("conductor/{run_id}")
    } else {
        base_branch.to_string()
    };
    Ok(RunRecord {
        run_id,
        spec_path: spec_path.to_path_buf(),
        frozen_spec_path: paths.frozen_spec,
        spec_hash: hash_bytes(contents.as_bytes()),
        acceptance_path: paths.acceptance,
        target_branch,
        base_branch: base_branch.to_string(),
        integration_branch,
        phase: RunPhase::Freeze,
        iteration: 1,
    })
}

/// Execute the freeze phase.
#[instrument(skip_all, fields(run_id = %o.checkpoint.run.run_id))]
pub fn run(o: &mut Orchestrator) -> Result<()> {
    let run = o.checkpoint.run.clone();

    if !run.frozen_spec_path.exists() {
        fs::copy(&run.spec_path, &run.frozen_spec_path).with_context(|| {
            format!(
                "freeze specification {} -> {}",
                run.spec_path.display(),
                run.frozen_spec_path.display()
            )
        })?;
        debug!(path = %run.frozen_spec_path.display(), "specification frozen");
    }
    crate::io::checkpoint::verify_spec_hash(&run.frozen_spec_path, &run.spec_hash)?;

    if run.integration_branch {
        o.worktrees
            .create_integration_branch(&run.target_branch, &run.base_branch)?;
    }

    if !run.acceptance_path.exists() {
        generate_acceptance(o)?;
    } else {
        // A resumed freeze never regenerates criteria; that would move the
        // evaluation target.
        debug!("acceptance criteria already present");
    }

    info!("freeze complete");
    Ok(())
}

/// Invoke the agent backend once to write acceptance criteria.
///
/// The agent runs in a scratch directory with the spec embedded in its
/// prompt; it has no repository access and no knowledge of where the
/// criteria will be stored.
fn generate_acceptance(o: &mut Orchestrator) -> Result<()> {
    let spec = fs::read_to_string(&o.checkpoint.run.frozen_spec_path).with_context(|| {
        format!("read {}", o.checkpoint.run.frozen_spec_path.display())
    })?;
    let workdir = o.paths.scratch.join("acceptance");
    fs::create_dir_all(&workdir).with_context(|| format!("create {}", workdir.display()))?;

    o.commit_event(Event::AgentSpawned {
        role: AgentRole::Acceptance,
        task_id: None,
        worktree: workdir.clone(),
    })?;
    let result = o.agent_backend.spawn(&crate::backend::SpawnRequest {
        workdir: workdir.clone(),
        prompt: prompt::acceptance(&spec)?,
        system_prompt: None,
        timeout: Duration::from_secs(o.config.agent_timeout_secs),
        env: Vec::new(),
        tail_lines: o.config.tail_lines,
        scratch_dir: workdir.clone(),
    })?;
    o.commit_event(Event::AgentFinished {
        role: AgentRole::Acceptance,
        task_id: None,
        status: result.status,
        exit_code: result.exit_code,
        duration_ms: result.duration_ms,
    })?;
    if result.status != AgentStatus::Success {
        return Err(anyhow!(
            "acceptance criteria generation failed ({:?}): {}",
            result.status,
            result.tail.join("\n")
        ));
    }

    let produced = workdir.join("acceptance.md");
    if !produced.exists() {
        return Err(anyhow!(
            "acceptance agent exited successfully but wrote no {}",
            produced.display()
        ));
    }
    fs::copy(&produced, &o.checkpoint.run.acceptance_path).with_context(|| {
        format!(
            "store acceptance criteria {}",
            o.checkpoint.run.acceptance_path.display()
        )
    })?;
    info!(path = %o.checkpoint.run.acceptance_path.display(), "acceptance criteria stored");
    Ok(())
}
