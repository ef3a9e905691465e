//! Step runner: performs one attempt of the step the decision engine chose.
//!
//! The runner owns the IN_PROGRESS -> DONE/FAILED half of the step lifecycle.
//! It reloads the state before every write and refuses to record anything for
//! a step that is no longer current, so an overlapping heartbeat or a manual
//! edit wins over a late outcome. Completion is reported on an event channel;
//! the runner never calls back into the decision engine itself.

use std::path::PathBuf;
use std::process::Command;
use std::sync::mpsc::Sender;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::delay;
use crate::core::types::{StepEvent, StepOutcome, StepTarget};
use crate::error::StepNotFoundError;
use crate::io::attempt_log::{AttemptMeta, write_attempt};
use crate::io::clock::Clock;
use crate::io::config::{DelayMode, ExecutorConfig};
use crate::io::executor::{ExecReport, ExecRequest, Executor};
use crate::io::process::run_command;
use crate::io::prompt::{PromptInputs, build_prompt};
use crate::io::state_store::{StateStore, commit_if_current};
use crate::state::{SequencerState, StepStatus};

/// Anything that can carry out a chosen step and report back.
pub trait Runner {
    /// Attempt `target` against `store`, sending at most one event.
    ///
    /// Sending nothing means the attempt left no recorded outcome and the
    /// caller should not re-evaluate until the next heartbeat.
    fn run(
        &self,
        store: &dyn StateStore,
        target: &StepTarget,
        events: &Sender<StepEvent>,
    ) -> Result<()>;
}

/// In-process runner driving an [`Executor`].
pub struct StepRunner<'a, E: Executor, C: Clock> {
    executor: &'a E,
    clock: &'a C,
    workdir: PathBuf,
    delay_mode: DelayMode,
}

impl<'a, E: Executor, C: Clock> StepRunner<'a, E, C> {
    pub fn new(executor: &'a E, clock: &'a C, workdir: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            clock,
            workdir: workdir.into(),
            delay_mode: DelayMode::default(),
        }
    }

    pub fn with_delay_mode(mut self, delay_mode: DelayMode) -> Self {
        self.delay_mode = delay_mode;
        self
    }

    /// Wait out (or defer on) the inter-step delay. Returns the reloaded state
    /// if the step may start now.
    fn pace(
        &self,
        store: &dyn StateStore,
        target: &StepTarget,
        state: SequencerState,
        events: &Sender<StepEvent>,
    ) -> Result<Option<SequencerState>> {
        let Some(wait) = delay::remaining(&state, target.index, self.clock.now()) else {
            return Ok(Some(state));
        };
        match self.delay_mode {
            DelayMode::Defer => {
                let until = delay::not_before(&state, target.index)
                    .ok_or_else(|| anyhow!("delay pending without a start bound"))?;
                info!(until = %until, "inter-step delay pending; deferring");
                send(
                    events,
                    StepEvent::Deferred {
                        step_id: target.step_id.clone(),
                        until,
                    },
                )?;
                Ok(None)
            }
            DelayMode::Sleep => {
                info!(wait_secs = wait.as_secs(), "waiting out inter-step delay");
                self.clock.sleep(wait);
                let reloaded = load_target(store, target, &[StepStatus::Pending])?;
                if reloaded.is_none() {
                    send(events, superseded(target))?;
                }
                Ok(reloaded)
            }
        }
    }

    fn execute(&self, state: &SequencerState, target: &StepTarget) -> Result<ExecReport> {
        let inputs = PromptInputs::from_state(state, &target.step_id).ok_or_else(|| {
            StepNotFoundError {
                step_id: target.step_id.clone(),
            }
        })?;
        let prompt = build_prompt(&inputs)?;
        let request = ExecRequest {
            workdir: self.workdir.clone(),
            step_id: target.step_id.clone(),
            prompt,
        };
        match self.executor.exec(&request) {
            Ok(report) => Ok(report),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "executor could not run");
                Ok(ExecReport {
                    outcome: StepOutcome::Failed {
                        error: format!("executor error: {err:#}"),
                    },
                    transcript: None,
                })
            }
        }
    }

    /// Persist the outcome if the step is still the one this attempt started.
    fn record(
        &self,
        store: &dyn StateStore,
        target: &StepTarget,
        outcome: &StepOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(before) = load_target(store, target, &[StepStatus::InProgress])? else {
            return Ok(false);
        };
        let mut after = before.clone();
        let run = after.run_mut(&target.step_id);
        run.finished_at = Some(finished_at);
        match outcome {
            StepOutcome::Succeeded { artifacts } => {
                run.status = StepStatus::Done;
                run.error = None;
                after.add_artifacts(&target.step_id, artifacts.iter().cloned());
            }
            StepOutcome::Failed { error } => {
                run.status = StepStatus::Failed;
                run.error = Some(error.clone());
            }
        }
        commit_if_current(store, &before, &after)
    }

    fn log_attempt(
        &self,
        store: &dyn StateStore,
        target: &StepTarget,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        report: &ExecReport,
    ) {
        let Some(attempts_dir) = store.attempts_dir() else {
            return;
        };
        let meta = AttemptMeta {
            step_id: target.step_id.clone(),
            tries: target.tries,
            outcome: report.outcome.clone(),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
        };
        match write_attempt(&attempts_dir, &meta, report.transcript.as_deref()) {
            Ok(paths) => debug!(log = %paths.meta_path.display(), "attempt logged"),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to write attempt log"),
        }
    }
}

impl<E: Executor, C: Clock> Runner for StepRunner<'_, E, C> {
    #[instrument(skip_all, fields(step_id = %target.step_id, tries = target.tries))]
    fn run(
        &self,
        store: &dyn StateStore,
        target: &StepTarget,
        events: &Sender<StepEvent>,
    ) -> Result<()> {
        let Some(state) =
            load_target(store, target, &[StepStatus::Pending, StepStatus::InProgress])?
        else {
            return send(events, superseded(target));
        };
        let Some(before) = self.pace(store, target, state, events)? else {
            return Ok(());
        };

        let started_at = self.clock.now();
        let mut marked = before.clone();
        let run = marked.run_mut(&target.step_id);
        run.status = StepStatus::InProgress;
        run.started_at = Some(started_at);
        run.finished_at = None;
        if !commit_if_current(store, &before, &marked)? {
            return send(events, superseded(target));
        }
        info!("step started");

        let report = self.execute(&marked, target)?;
        let finished_at = self.clock.now();
        let recorded = self.record(store, target, &report.outcome, finished_at)?;
        self.log_attempt(store, target, started_at, finished_at, &report);

        if !recorded {
            warn!("state moved on during execution; outcome discarded");
            return send(events, superseded(target));
        }
        info!(success = report.outcome.is_success(), "step finished");
        send(
            events,
            StepEvent::Finished {
                step_id: target.step_id.clone(),
                outcome: report.outcome,
            },
        )
    }
}

/// Delegates each attempt to an external program invoked as `<program> <state-path>`.
///
/// The program owns the state transitions for the attempt; afterwards the
/// runner only inspects what it recorded.
#[derive(Debug, Clone)]
pub struct ExternalRunner {
    program: PathBuf,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
}

impl ExternalRunner {
    pub fn new(program: impl Into<PathBuf>, executor: &ExecutorConfig) -> Self {
        Self {
            program: program.into(),
            timeout: executor.timeout_secs.map(Duration::from_secs),
            output_limit_bytes: executor.output_limit_bytes,
        }
    }
}

impl Runner for ExternalRunner {
    #[instrument(skip_all, fields(step_id = %target.step_id, program = %self.program.display()))]
    fn run(
        &self,
        store: &dyn StateStore,
        target: &StepTarget,
        events: &Sender<StepEvent>,
    ) -> Result<()> {
        let state_path = store.state_path().ok_or_else(|| {
            anyhow!(
                "external runner needs a file-backed state store, got {}",
                store.location()
            )
        })?;
        let mut cmd = Command::new(&self.program);
        cmd.arg(&state_path);
        let output = run_command(cmd, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run {}", self.program.display()))?;
        if output.timed_out || !output.status.success() {
            warn!(
                exit_code = ?output.status.code(),
                timed_out = output.timed_out,
                stderr = %output.stderr_lossy().trim(),
                "external runner exited unsuccessfully"
            );
        }

        let Some(state) = store.load()? else {
            return Ok(());
        };
        let run = state.run_of(&target.step_id);
        let outcome = match run.status {
            StepStatus::Done => StepOutcome::Succeeded {
                artifacts: state
                    .artifacts
                    .get(&target.step_id)
                    .cloned()
                    .unwrap_or_default(),
            },
            StepStatus::Failed => StepOutcome::Failed {
                error: run.error.unwrap_or_default(),
            },
            StepStatus::Pending | StepStatus::InProgress => {
                info!(status = run.status.as_str(), "external runner left no outcome");
                return Ok(());
            }
        };
        send(
            events,
            StepEvent::Finished {
                step_id: target.step_id.clone(),
                outcome,
            },
        )
    }
}

/// Reload and return the state only if `target` is still the current step,
/// unblocked, at the same try, and in one of `statuses`.
fn load_target(
    store: &dyn StateStore,
    target: &StepTarget,
    statuses: &[StepStatus],
) -> Result<Option<SequencerState>> {
    let Some(state) = store.load()? else {
        return Ok(None);
    };
    let run = state.run_of(&target.step_id);
    let current = !state.is_done()
        && state.current_step == target.index
        && state.current_step_id() == Some(target.step_id.as_str())
        && !state.blockers.contains(&target.step_id)
        && run.tries == target.tries
        && statuses.contains(&run.status);
    if !current {
        debug!(
            current_step = state.current_step,
            status = run.status.as_str(),
            tries = run.tries,
            "target is no longer current"
        );
        return Ok(None);
    }
    Ok(Some(state))
}

fn superseded(target: &StepTarget) -> StepEvent {
    StepEvent::Superseded {
        step_id: target.step_id.clone(),
    }
}

fn send(events: &Sender<StepEvent>, event: StepEvent) -> Result<()> {
    events
        .send(event)
        .map_err(|_| anyhow!("step event receiver dropped"))
}
