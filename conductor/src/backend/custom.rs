//! Fully user-configurable command-line backend.
//!
//! The operator supplies an argv template; `{prompt}`, `{workdir}` and
//! `{schema}` are substituted per pass. Without a `{prompt}` placeholder the
//! prompt is delivered on stdin, matching the reference products.

use anyhow::{Result, anyhow};

use crate::backend::{
    AgentBackend, JudgeBackend, JudgeRequest, PassOutput, PassRequest, PassRunner, SpawnRequest,
    spawn_with, two_pass_evaluate,
};
use crate::core::types::{AgentResult, JudgeResult};
use crate::io::process::{self, ProcessRequest};

#[derive(Debug, Clone)]
pub struct CustomBackend {
    command: Vec<String>,
}

impl CustomBackend {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl PassRunner for CustomBackend {
    fn run_pass(&self, request: &PassRequest) -> Result<PassOutput> {
        let (program, template_args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("custom backend requires a non-empty custom.command"))?;

        let schema = request
            .schema_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let workdir = request.workdir.display().to_string();

        let mut prompt_inline = false;
        let args: Vec<String> = template_args
            .iter()
            .map(|arg| {
                if arg.contains("{prompt}") {
                    prompt_inline = true;
                }
                arg.replace("{prompt}", &request.prompt)
                    .replace("{workdir}", &workdir)
                    .replace("{schema}", &schema)
            })
            .collect();

        let stdin = if prompt_inline {
            None
        } else {
            Some(request.prompt.clone().into_bytes())
        };

        let result = process::run(&ProcessRequest {
            program: program.clone(),
            args,
            workdir: request.workdir.clone(),
            timeout: request.timeout,
            env: request.env.clone(),
            stdin,
            tail_lines: request.tail_lines,
        })?;

        let payload = result.tail.join("\n");
        Ok(PassOutput {
            process: result,
            payload,
        })
    }
}

impl AgentBackend for CustomBackend {
    fn name(&self) -> &'static str {
        "custom"
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<AgentResult> {
        spawn_with(self, request)
    }
}

impl JudgeBackend for CustomBackend {
    fn name(&self) -> &'static str {
        "custom"
    }

    fn evaluate(&self, request: &JudgeRequest) -> Result<JudgeResult> {
        two_pass_evaluate(self, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AgentStatus;
    use std::time::Duration;

    fn spawn_request(temp: &std::path::Path, prompt: &str, timeout: Duration) -> SpawnRequest {
        SpawnRequest {
            workdir: temp.to_path_buf(),
            prompt: prompt.to_string(),
            system_prompt: None,
            timeout,
            env: Vec::new(),
            tail_lines: 50,
            scratch_dir: temp.join("scratch"),
        }
    }

    #[test]
    fn prompt_placeholder_is_substituted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = CustomBackend::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo {prompt}".to_string(),
        ]);
        let result = backend
            .spawn(&spawn_request(temp.path(), "hello-there", Duration::from_secs(5)))
            .expect("spawn");
        assert_eq!(result.status, AgentStatus::Success);
        assert!(result.tail.contains(&"hello-there".to_string()));
    }

    #[test]
    fn prompt_goes_to_stdin_without_placeholder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = CustomBackend::new(vec!["cat".to_string()]);
        let result = backend
            .spawn(&spawn_request(temp.path(), "via stdin", Duration::from_secs(5)))
            .expect("spawn");
        assert_eq!(result.status, AgentStatus::Success);
        assert!(result.tail.contains(&"via stdin".to_string()));
    }

    #[test]
    fn nonzero_exit_maps_to_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = CustomBackend::new(vec!["false".to_string()]);
        let result = backend
            .spawn(&spawn_request(temp.path(), "x", Duration::from_secs(5)))
            .expect("spawn");
        assert_eq!(result.status, AgentStatus::Failure);
    }

    #[test]
    fn empty_command_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = CustomBackend::new(Vec::new());
        assert!(
            backend
                .spawn(&spawn_request(temp.path(), "x", Duration::from_secs(5)))
                .is_err()
        );
    }
}
