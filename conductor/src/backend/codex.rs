//! `codex` CLI integration.
//!
//! Non-interactive invocation via `codex exec` with the prompt on stdin. The
//! product writes its final message to a file (`--output-last-message`) and
//! accepts a strict output schema for extraction passes.

use std::fs;

use anyhow::{Context, Result};

use crate::backend::{
    AgentBackend, JudgeBackend, JudgeRequest, PassOutput, PassRequest, PassRunner, SpawnRequest,
    spawn_with, two_pass_evaluate,
};
use crate::core::types::{AgentResult, JudgeResult};
use crate::io::process::{self, ProcessRequest};

#[derive(Debug, Clone)]
pub struct CodexBackend {
    program: String,
}

impl Default for CodexBackend {
    fn default() -> Self {
        Self {
            program: "codex".to_string(),
        }
    }
}

impl PassRunner for CodexBackend {
    fn run_pass(&self, request: &PassRequest) -> Result<PassOutput> {
        fs::create_dir_all(&request.scratch_dir)
            .with_context(|| format!("create {}", request.scratch_dir.display()))?;
        let last_message_path = request.scratch_dir.join("last_message.txt");
        // A leftover from a previous pass must not masquerade as output.
        if last_message_path.exists() {
            fs::remove_file(&last_message_path)
                .with_context(|| format!("remove stale {}", last_message_path.display()))?;
        }

        let mut args = vec![
            "exec".to_string(),
            "--sandbox".to_string(),
            "danger-full-access".to_string(),
            "--skip-git-repo-check".to_string(),
        ];
        if let Some(schema_path) = &request.schema_path {
            args.push("--output-schema".to_string());
            args.push(schema_path.display().to_string());
        }
        args.push("--output-last-message".to_string());
        args.push(last_message_path.display().to_string());
        args.push("-".to_string());

        // No system-prompt flag; fold it into the prompt.
        let prompt = match &request.system_prompt {
            Some(system_prompt) => format!("{system_prompt}\n\n{}", request.prompt),
            None => request.prompt.clone(),
        };

        let result = process::run(&ProcessRequest {
            program: self.program.clone(),
            args,
            workdir: request.workdir.clone(),
            timeout: request.timeout,
            env: request.env.clone(),
            stdin: Some(prompt.into_bytes()),
            tail_lines: request.tail_lines,
        })?;

        let payload = match fs::read_to_string(&last_message_path) {
            Ok(contents) => contents,
            // Killed before writing the file; the tail is all we have.
            Err(_) => result.tail.join("\n"),
        };
        Ok(PassOutput {
            process: result,
            payload,
        })
    }
}

impl AgentBackend for CodexBackend {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<AgentResult> {
        spawn_with(self, request)
    }
}

impl JudgeBackend for CodexBackend {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn evaluate(&self, request: &JudgeRequest) -> Result<JudgeResult> {
        two_pass_evaluate(self, request)
    }
}
