//! Agent-product backends.
//!
//! Two narrow capability sets, [`AgentBackend`] for one-shot coding
//! invocations and [`JudgeBackend`] for evaluation, implemented once per
//! supported product and selected once at startup. The orchestrator never
//! branches on the product inline.
//!
//! Each product implements the internal [`PassRunner`] seam (build a command
//! line for one non-interactive pass, run it, surface its payload); the
//! spawn wrapper and the shared two-pass judge protocol are layered on top,
//! so a future backend that produces high-quality structured reasoning in
//! one pass changes nothing outside its own file.

pub mod claude;
pub mod codex;
pub mod custom;
pub mod parse;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{AgentResult, AgentStatus, JudgeResult};
use crate::io::config::Config;
use crate::io::process::ProcessResult;

pub const JUDGE_VERDICT_SCHEMA: &str = include_str!("../../schemas/judge_verdict.schema.json");

/// Judge passes carry payload, not diagnostics; keep enough lines that the
/// extraction pass's JSON survives the tail.
const PASS_TAIL_LINES: usize = 4096;

/// One-shot, non-interactive agent invocation.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub workdir: PathBuf,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    pub tail_lines: usize,
    /// Directory for backend artifacts (output files, schemas). Outside the
    /// worktree so agents never see them.
    pub scratch_dir: PathBuf,
}

/// One evaluation over a read-only worktree.
#[derive(Debug, Clone)]
pub struct JudgeRequest {
    pub workdir: PathBuf,
    pub frozen_spec_path: PathBuf,
    pub acceptance_path: PathBuf,
    pub observation_task_ids: Vec<String>,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    pub scratch_dir: PathBuf,
}

/// Spawns coding/maintenance/decomposition agents.
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &'static str;
    /// Run to completion; the contract does not support multi-turn
    /// interaction.
    fn spawn(&self, request: &SpawnRequest) -> Result<AgentResult>;
}

/// Evaluates a finished iteration.
pub trait JudgeBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, request: &JudgeRequest) -> Result<JudgeResult>;
}

/// One non-interactive pass against the product CLI.
#[derive(Debug, Clone)]
pub(crate) struct PassRequest {
    pub workdir: PathBuf,
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Strict output schema for extraction passes.
    pub schema_path: Option<PathBuf>,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    pub tail_lines: usize,
    pub scratch_dir: PathBuf,
}

/// Raw outcome of one pass.
#[derive(Debug, Clone)]
pub(crate) struct PassOutput {
    pub process: ProcessResult,
    /// The product's final payload: an output file where the product writes
    /// one, the captured tail otherwise.
    pub payload: String,
}

/// Product seam: build and run one pass.
pub(crate) trait PassRunner {
    fn run_pass(&self, request: &PassRequest) -> Result<PassOutput>;
}

/// Map a finished pass to the normalized agent result.
pub(crate) fn agent_result(process: &ProcessResult) -> AgentResult {
    let status = if process.timed_out {
        AgentStatus::Timeout
    } else if process.exit_code == Some(0) {
        AgentStatus::Success
    } else {
        AgentStatus::Failure
    };
    AgentResult {
        status,
        exit_code: process.exit_code,
        tail: process.tail.clone(),
        duration_ms: process.duration.as_millis() as u64,
    }
}

/// Shared [`AgentBackend::spawn`] body.
pub(crate) fn spawn_with<B: PassRunner>(backend: &B, request: &SpawnRequest) -> Result<AgentResult> {
    let pass = PassRequest {
        workdir: request.workdir.clone(),
        prompt: request.prompt.clone(),
        system_prompt: request.system_prompt.clone(),
        schema_path: None,
        timeout: request.timeout,
        env: request.env.clone(),
        tail_lines: request.tail_lines,
        scratch_dir: request.scratch_dir.clone(),
    };
    let output = backend.run_pass(&pass)?;
    Ok(agent_result(&output.process))
}

/// Shared two-pass [`JudgeBackend::evaluate`] body.
///
/// Pass 1 runs with full read access and produces free-form findings
/// (structured-output constraints measurably degrade reasoning quality);
/// pass 2 re-invokes the product over those findings under the strict
/// verdict schema. A pass-1 timeout or non-zero exit short-circuits to a
/// failure result without running pass 2.
#[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
pub(crate) fn two_pass_evaluate<B: PassRunner>(
    backend: &B,
    request: &JudgeRequest,
) -> Result<JudgeResult> {
    let deadline = Instant::now() + request.timeout;
    let spec = std::fs::read_to_string(&request.frozen_spec_path)
        .with_context(|| format!("read {}", request.frozen_spec_path.display()))?;
    let acceptance = std::fs::read_to_string(&request.acceptance_path)
        .with_context(|| format!("read {}", request.acceptance_path.display()))?;

    let pass1 = PassRequest {
        workdir: request.workdir.clone(),
        prompt: crate::prompt::judge_pass1(&spec, &acceptance, &request.observation_task_ids)?,
        system_prompt: None,
        schema_path: None,
        timeout: remaining(deadline)?,
        env: request.env.clone(),
        tail_lines: PASS_TAIL_LINES,
        scratch_dir: request.scratch_dir.clone(),
    };
    debug!("running judge pass 1 (findings)");
    let findings = backend.run_pass(&pass1)?;
    if findings.process.timed_out {
        warn!("judge pass 1 timed out; skipping extraction pass");
        return Ok(JudgeResult::evaluation_error("findings pass timed out"));
    }
    if !findings.process.success() {
        warn!(exit_code = ?findings.process.exit_code, "judge pass 1 failed");
        return Ok(JudgeResult::evaluation_error(format!(
            "findings pass exited with {:?}",
            findings.process.exit_code
        )));
    }

    let schema_path = write_schema(&request.scratch_dir)?;
    let pass2 = PassRequest {
        workdir: request.workdir.clone(),
        prompt: crate::prompt::judge_pass2(&findings.payload, JUDGE_VERDICT_SCHEMA)?,
        system_prompt: None,
        schema_path: Some(schema_path),
        timeout: remaining(deadline)?,
        env: request.env.clone(),
        tail_lines: PASS_TAIL_LINES,
        scratch_dir: request.scratch_dir.clone(),
    };
    debug!("running judge pass 2 (extraction)");
    let extraction = backend.run_pass(&pass2)?;
    if extraction.process.timed_out || !extraction.process.success() {
        warn!(exit_code = ?extraction.process.exit_code, "judge pass 2 failed");
        return Ok(JudgeResult::evaluation_error(format!(
            "extraction pass failed (timed_out={}, exit={:?})",
            extraction.process.timed_out, extraction.process.exit_code
        )));
    }

    parse_verdict(&extraction.payload)
}

/// Validate the extracted payload against the verdict schema and parse it.
pub(crate) fn parse_verdict(payload: &str) -> Result<JudgeResult> {
    let Some(object) = parse::first_json_object(payload) else {
        return Ok(JudgeResult::evaluation_error(
            "extraction pass produced no JSON object",
        ));
    };
    let value: serde_json::Value = serde_json::from_str(object).context("parse verdict JSON")?;
    let schema: serde_json::Value =
        serde_json::from_str(JUDGE_VERDICT_SCHEMA).context("parse verdict schema")?;
    let compiled = jsonschema::options()
        .with_draft(jsonschema::Draft::Draft202012)
        .build(&schema)
        .context("compile verdict schema")?;
    let violations: Vec<String> = compiled.iter_errors(&value).map(|e| e.to_string()).collect();
    if !violations.is_empty() {
        return Ok(JudgeResult::evaluation_error(format!(
            "verdict failed schema validation: {}",
            violations.join("; ")
        )));
    }
    let result: JudgeResult = serde_json::from_value(value).context("parse verdict struct")?;
    Ok(result)
}

fn write_schema(scratch_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(scratch_dir)
        .with_context(|| format!("create {}", scratch_dir.display()))?;
    let path = scratch_dir.join("judge_verdict.schema.json");
    std::fs::write(&path, JUDGE_VERDICT_SCHEMA)
        .with_context(|| format!("write schema {}", path.display()))?;
    Ok(path)
}

fn remaining(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::ZERO);
    if remaining.is_zero() {
        return Err(anyhow!("evaluation budget exhausted"));
    }
    Ok(remaining)
}

/// Supported backend products, in auto-detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Claude,
    Codex,
    Custom,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::Codex => "codex",
            BackendKind::Custom => "custom",
        }
    }
}

/// Resolve the backend to use.
///
/// An explicit configuration wins; otherwise probe the search path for known
/// executables in priority order, first found wins. No backend and no
/// override is a configuration error with an actionable message.
pub fn detect(config: &Config) -> Result<BackendKind> {
    match config.backend.as_str() {
        "" => {}
        "claude" => return Ok(BackendKind::Claude),
        "codex" => return Ok(BackendKind::Codex),
        "custom" => return Ok(BackendKind::Custom),
        other => return Err(anyhow!("unknown backend '{other}' (claude|codex|custom)")),
    }
    for (kind, program) in [(BackendKind::Claude, "claude"), (BackendKind::Codex, "codex")] {
        if find_in_path(program).is_some() {
            info!(backend = kind.as_str(), "auto-detected backend");
            return Ok(kind);
        }
    }
    Err(anyhow!(
        "no agent backend found on PATH (looked for `claude`, `codex`); install one or set \
         `backend` in conductor.toml"
    ))
}

/// Construct the selected product's capability pair.
///
/// The agent half is shared across worker threads; the judge half only ever
/// runs on the control thread.
pub fn create(
    kind: BackendKind,
    config: &Config,
) -> (Arc<dyn AgentBackend>, Box<dyn JudgeBackend>) {
    match kind {
        BackendKind::Claude => (
            Arc::new(claude::ClaudeBackend::default()),
            Box::new(claude::ClaudeBackend::default()),
        ),
        BackendKind::Codex => (
            Arc::new(codex::CodexBackend::default()),
            Box::new(codex::CodexBackend::default()),
        ),
        BackendKind::Custom => (
            Arc::new(custom::CustomBackend::new(config.custom.command.clone())),
            Box::new(custom::CustomBackend::new(config.custom.command.clone())),
        ),
    }
}

/// Search `PATH` for an executable file named `program`.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}
