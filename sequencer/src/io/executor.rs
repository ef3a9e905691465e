//! Executor abstraction for step invocation.
//!
//! The [`Executor`] trait decouples the step runner from whatever actually
//! performs a step's work (by default, a configured command with the prompt
//! appended as its final argument). Tests use scripted executors that return
//! predetermined outcomes without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::StepOutcome;
use crate::io::config::ExecutorConfig;
use crate::io::process::{CommandOutput, run_command};

/// Prefix of stdout lines that report an output reference for the step.
pub const ARTIFACT_PREFIX: &str = "artifact:";

/// Parameters for one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the executor process.
    pub workdir: PathBuf,
    pub step_id: String,
    /// Prompt text: the plain instruction, or the troubleshoot prompt on retries.
    pub prompt: String,
}

/// What an executor hands back: the attempt outcome plus its captured transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecReport {
    pub outcome: StepOutcome,
    /// Captured output for the attempt log, if any.
    pub transcript: Option<String>,
}

/// Abstraction over step execution backends.
///
/// `Err` means the executor could not be run at all; the runner records it
/// as a failed attempt like any other failure.
pub trait Executor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecReport>;
}

/// Executor that spawns the configured command template.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: Vec<String>,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
}

impl CommandExecutor {
    pub fn new(command: Vec<String>) -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            command,
            timeout: None,
            output_limit_bytes: defaults.output_limit_bytes,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    fn build_command(&self, request: &ExecRequest) -> Result<Command> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("executor command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&request.prompt)
            .current_dir(&request.workdir);
        Ok(cmd)
    }
}

impl Executor for CommandExecutor {
    #[instrument(skip_all, fields(step_id = %request.step_id, program = ?self.command.first()))]
    fn exec(&self, request: &ExecRequest) -> Result<ExecReport> {
        info!(workdir = %request.workdir.display(), "starting executor");
        let cmd = self.build_command(request)?;
        let output = run_command(cmd, self.timeout, self.output_limit_bytes)?;
        let transcript = Some(render_transcript(&output));

        if output.timed_out {
            warn!(timeout = ?self.timeout, "executor timed out");
            return Ok(ExecReport {
                outcome: StepOutcome::Failed {
                    error: format!("executor timed out after {:?}", self.timeout.unwrap_or_default()),
                },
                transcript,
            });
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "executor failed");
            return Ok(ExecReport {
                outcome: StepOutcome::Failed {
                    error: failure_message(&output),
                },
                transcript,
            });
        }

        let artifacts = parse_artifacts(&output.stdout_lossy());
        debug!(artifacts = artifacts.len(), "executor completed successfully");
        Ok(ExecReport {
            outcome: StepOutcome::Succeeded { artifacts },
            transcript,
        })
    }
}

/// Error text recorded on the step: exit status, then stderr (or stdout if stderr is empty).
fn failure_message(output: &CommandOutput) -> String {
    let status = match output.status.code() {
        Some(code) => format!("executor exited with status {code}"),
        None => "executor terminated by signal".to_string(),
    };
    let stderr = output.stderr_lossy();
    let stdout = output.stdout_lossy();
    let detail = if !stderr.trim().is_empty() {
        stderr
    } else {
        stdout
    };
    let detail = detail.trim();
    if detail.is_empty() {
        status
    } else {
        format!("{status}: {detail}")
    }
}

/// Collect `artifact: <reference>` lines from executor stdout.
pub fn parse_artifacts(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(ARTIFACT_PREFIX))
        .map(str::trim)
        .filter(|reference| !reference.is_empty())
        .map(str::to_string)
        .collect()
}

fn render_transcript(output: &CommandOutput) -> String {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_lossy());
    buf.push_str(&output.stdout_truncated_notice("executor"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_lossy());
    buf.push_str(&output.stderr_truncated_notice("executor"));
    if output.timed_out {
        buf.push_str("\n[executor timed out]\n");
    }
    buf
}
