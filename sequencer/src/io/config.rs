//! Sequencer configuration: `.sequencer/config.toml` plus environment overrides.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

/// Executor command template (the prompt is appended as the final argument).
pub const ENV_AGENT_CMD: &str = "STEP_AGENT_CMD";
/// Alternate Step Runner program, invoked as `<program> <state-path>`.
pub const ENV_RUNNER: &str = "STEP_RUNNER";
/// Failed attempts allowed before a step becomes a blocker.
pub const ENV_MAX_RETRIES: &str = "STEP_MAX_RETRIES";

/// How the runner honors `stepDelayMinutes`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DelayMode {
    /// Block in-process until the delay has elapsed.
    #[default]
    Sleep,
    /// Return without running; a later heartbeat picks the step up.
    Defer,
}

/// Sequencer configuration (TOML).
///
/// Missing fields default to the values a bare install uses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SequencerConfig {
    /// Failed attempts per step before it is added to `blockers`.
    pub max_retries: u32,

    pub delay_mode: DelayMode,

    /// Cadence of `step-sequencer watch`.
    pub watch_interval_secs: u64,

    pub executor: ExecutorConfig,

    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Command template, e.g. `["claude", "-p"]`.
    pub command: Vec<String>,

    /// Kill the executor after this many seconds. Unbounded when absent.
    pub timeout_secs: Option<u64>,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RunnerConfig {
    /// Delegate step execution to this program instead of the built-in runner.
    pub program: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: vec!["echo".to_string()],
            timeout_secs: None,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_mode: DelayMode::Sleep,
            watch_interval_secs: 60,
            executor: ExecutorConfig::default(),
            runner: RunnerConfig::default(),
        }
    }
}

impl SequencerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be > 0"));
        }
        if self.watch_interval_secs == 0 {
            return Err(anyhow!("watch_interval_secs must be > 0"));
        }
        if self.executor.command.is_empty() || self.executor.command[0].trim().is_empty() {
            return Err(anyhow!("executor.command must be a non-empty array"));
        }
        if self.executor.timeout_secs == Some(0) {
            return Err(anyhow!("executor.timeout_secs must be > 0 when set"));
        }
        if self.executor.output_limit_bytes == 0 {
            return Err(anyhow!("executor.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Apply `STEP_*` overrides from an environment snapshot.
    ///
    /// Empty values are ignored so an exported-but-blank variable does not
    /// clobber the file config. `STEP_AGENT_CMD` is split on whitespace with
    /// no quote handling; put arguments containing spaces in the TOML
    /// `executor.command` array instead.
    pub fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<()> {
        if let Some(cmd) = non_empty(env, ENV_AGENT_CMD) {
            self.executor.command = cmd.split_whitespace().map(str::to_string).collect();
        }
        if let Some(runner) = non_empty(env, ENV_RUNNER) {
            self.runner.program = Some(PathBuf::from(runner));
        }
        if let Some(raw) = non_empty(env, ENV_MAX_RETRIES) {
            self.max_retries = raw
                .trim()
                .parse()
                .with_context(|| format!("parse {ENV_MAX_RETRIES}={raw}"))?;
        }
        Ok(())
    }
}

fn non_empty<'a>(env: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    env.get(key)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
}

/// Load config from a TOML file, unvalidated.
///
/// If the file is missing, returns `SequencerConfig::default()`. Callers
/// validate after layering overrides (see [`resolve_config_with_env`]).
pub fn load_config(path: &Path) -> Result<SequencerConfig> {
    if !path.exists() {
        return Ok(SequencerConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Load the file config, layer the process environment on top, then validate.
pub fn resolve_config(path: &Path) -> Result<SequencerConfig> {
    let env: HashMap<String, String> = std::env::vars().collect();
    resolve_config_with_env(path, &env)
}

pub fn resolve_config_with_env(
    path: &Path,
    env: &HashMap<String, String>,
) -> Result<SequencerConfig> {
    let mut cfg = load_config(path)?;
    cfg.apply_env(env)?;
    cfg.validate()?;
    debug!(
        max_retries = cfg.max_retries,
        command = ?cfg.executor.command,
        runner = ?cfg.runner.program,
        "config resolved"
    );
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SequencerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp config in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("write temp config {}", tmp.path().display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SequencerConfig::default());
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.executor.command, vec!["echo"]);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = SequencerConfig {
            delay_mode: DelayMode::Defer,
            executor: ExecutorConfig {
                timeout_secs: Some(600),
                ..ExecutorConfig::default()
            },
            ..SequencerConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn environment_overrides_file_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_retries = 5\n[executor]\ncommand = [\"agent\"]\n").expect("write");

        let cfg = resolve_config_with_env(
            &path,
            &env(&[
                (ENV_AGENT_CMD, "claude -p"),
                (ENV_MAX_RETRIES, "2"),
                (ENV_RUNNER, ""),
            ]),
        )
        .expect("resolve");
        assert_eq!(cfg.executor.command, vec!["claude", "-p"]);
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.runner.program, None);
    }

    #[test]
    fn rejects_zero_retries_and_garbage_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");

        let err = resolve_config_with_env(&path, &env(&[(ENV_MAX_RETRIES, "0")])).unwrap_err();
        assert!(err.to_string().contains("max_retries must be > 0"));

        let err = resolve_config_with_env(&path, &env(&[(ENV_MAX_RETRIES, "many")])).unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_RETRIES));
    }

    #[test]
    fn validation_runs_after_environment_overrides() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_retries = 0\n").expect("write");

        let err = resolve_config_with_env(&path, &env(&[])).unwrap_err();
        assert!(err.to_string().contains("max_retries must be > 0"));

        let cfg = resolve_config_with_env(&path, &env(&[(ENV_MAX_RETRIES, "3")])).expect("resolve");
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn agent_command_splits_on_whitespace_only() {
        let mut cfg = SequencerConfig::default();
        cfg.apply_env(&env(&[(ENV_AGENT_CMD, "agent --flag 'two words'")]))
            .expect("apply");
        assert_eq!(
            cfg.executor.command,
            vec!["agent", "--flag", "'two", "words'"]
        );
    }
}
