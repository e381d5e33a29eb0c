//! `claude` CLI integration.
//!
//! Non-interactive invocation via `claude --print` with the prompt on stdin.
//! The product has no native output-schema flag, so extraction passes rely
//! on the schema embedded in the prompt plus envelope-tolerant parsing.

use anyhow::Result;

use crate::backend::{
    AgentBackend, JudgeBackend, JudgeRequest, PassOutput, PassRequest, PassRunner, SpawnRequest,
    spawn_with, two_pass_evaluate,
};
use crate::core::types::{AgentResult, JudgeResult};
use crate::io::process::{self, ProcessRequest};

#[derive(Debug, Clone)]
pub struct ClaudeBackend {
    program: String,
}

impl Default for ClaudeBackend {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
        }
    }
}

impl PassRunner for ClaudeBackend {
    fn run_pass(&self, request: &PassRequest) -> Result<PassOutput> {
        let mut args = vec![
            "--print".to_string(),
            "--permission-mode".to_string(),
            "bypassPermissions".to_string(),
        ];
        if let Some(system_prompt) = &request.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(system_prompt.clone());
        }

        let result = process::run(&ProcessRequest {
            program: self.program.clone(),
            args,
            workdir: request.workdir.clone(),
            timeout: request.timeout,
            env: request.env.clone(),
            stdin: Some(request.prompt.clone().into_bytes()),
            tail_lines: request.tail_lines,
        })?;

        // `--print` emits only the final response, so the tail is the payload.
        let payload = result.tail.join("\n");
        Ok(PassOutput {
            process: result,
            payload,
        })
    }
}

impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<AgentResult> {
        spawn_with(self, request)
    }
}

impl JudgeBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn evaluate(&self, request: &JudgeRequest) -> Result<JudgeResult> {
        two_pass_evaluate(self, request)
    }
}
