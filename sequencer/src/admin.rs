//! Manual interventions and read-only reporting for a persisted plan.

use std::fmt::Write as _;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use crate::error::{NoPlanError, StepNotFoundError};
use crate::io::state_store::{StateStore, commit_if_current};
use crate::state::{SequencerState, SequencerStatus, StepStatus};

fn load_required(store: &dyn StateStore) -> Result<SequencerState> {
    store.load()?.ok_or_else(|| {
        NoPlanError {
            location: store.location(),
        }
        .into()
    })
}

fn ensure_step(state: &SequencerState, step_id: &str) -> Result<()> {
    if state.plan.steps.contains_key(step_id) {
        return Ok(());
    }
    Err(StepNotFoundError {
        step_id: step_id.to_string(),
    }
    .into())
}

fn commit(store: &dyn StateStore, before: &SequencerState, after: &SequencerState) -> Result<()> {
    if commit_if_current(store, before, after)? {
        return Ok(());
    }
    Err(anyhow!(
        "state at {} changed while applying the change; retry",
        store.location()
    ))
}

/// Clear a blocker so the next heartbeat attempts the step again.
///
/// A FAILED step goes back to PENDING. Unless `keep_tries` is set its retry
/// budget starts over and the next attempt receives the plain instruction.
#[instrument(skip_all, fields(store = %store.location(), step_id, keep_tries))]
pub fn unblock(store: &dyn StateStore, step_id: &str, keep_tries: bool) -> Result<SequencerState> {
    let before = load_required(store)?;
    ensure_step(&before, step_id)?;
    if before.is_done() {
        return Err(anyhow!("plan is already DONE; nothing to unblock"));
    }

    let mut after = before.clone();
    let was_blocked = after.blockers.remove(step_id);
    let run = after.run_mut(step_id);
    let was_failed = run.status == StepStatus::Failed;
    if was_failed {
        run.status = StepStatus::Pending;
    }
    if !keep_tries {
        run.tries = 0;
    }
    if !was_blocked && !was_failed {
        return Err(anyhow!("step '{step_id}' is neither blocked nor failed"));
    }

    commit(store, &before, &after)?;
    info!(was_blocked, was_failed, "step unblocked");
    Ok(after)
}

/// Record an output reference under `key` (usually a step id).
#[instrument(skip_all, fields(store = %store.location(), key))]
pub fn add_artifact(store: &dyn StateStore, key: &str, reference: &str) -> Result<SequencerState> {
    let before = load_required(store)?;
    if before.is_done() {
        return Err(anyhow!("plan is DONE; its state is frozen"));
    }
    let reference = reference.trim();
    if key.trim().is_empty() || reference.is_empty() {
        return Err(anyhow!("artifact key and reference must not be empty"));
    }
    let mut after = before.clone();
    after.add_artifacts(key, [reference.to_string()]);
    commit(store, &before, &after)?;
    info!(reference, "artifact recorded");
    Ok(after)
}

/// Archive label derived from the archive time, e.g. `20260101T090000Z`.
pub fn archive_label(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}

/// One row of [`StatusReport`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub index: usize,
    pub step_id: String,
    pub title: String,
    pub status: StepStatus,
    pub tries: u32,
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Operator-facing summary of a plan's progress.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub location: String,
    pub status: SequencerStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub steps: Vec<StepSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_iso: Option<DateTime<Utc>>,
    pub artifacts: usize,
}

impl StatusReport {
    pub fn from_state(location: &str, state: &SequencerState) -> Self {
        let steps = state
            .step_queue
            .iter()
            .enumerate()
            .map(|(index, step_id)| {
                let run = state.run_of(step_id);
                StepSummary {
                    index,
                    step_id: step_id.clone(),
                    title: state
                        .plan
                        .steps
                        .get(step_id)
                        .map(|s| s.title.clone())
                        .unwrap_or_default(),
                    status: run.status,
                    tries: run.tries,
                    blocked: state.blockers.contains(step_id),
                    error: run.error,
                }
            })
            .collect();
        Self {
            location: location.to_string(),
            status: state.status,
            current_step: state.current_step,
            total_steps: state.step_queue.len(),
            steps,
            last_heartbeat_iso: state.last_heartbeat_iso,
            artifacts: state.artifacts.values().map(Vec::len).sum(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.steps
            .get(self.current_step)
            .is_some_and(|step| step.blocked)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let status = match self.status {
            SequencerStatus::InProgress => "IN_PROGRESS",
            SequencerStatus::Done => "DONE",
        };
        let _ = writeln!(out, "plan: {}", self.location);
        let _ = writeln!(
            out,
            "status: {status} ({}/{} steps done)",
            self.steps
                .iter()
                .filter(|s| s.status == StepStatus::Done)
                .count(),
            self.total_steps
        );
        if let Some(heartbeat) = self.last_heartbeat_iso {
            let _ = writeln!(out, "last heartbeat: {}", heartbeat.to_rfc3339());
        }
        for step in &self.steps {
            let marker = if step.index == self.current_step { ">" } else { " " };
            let _ = write!(
                out,
                "{marker} {:>2}. {} [{}]",
                step.index + 1,
                step.step_id,
                step.status.as_str()
            );
            if step.tries > 0 {
                let _ = write!(out, " tries={}", step.tries);
            }
            if step.blocked {
                out.push_str(" BLOCKED");
            }
            out.push('\n');
            if let Some(error) = step.error.as_deref().and_then(|e| e.lines().next()) {
                let _ = writeln!(out, "      error: {error}");
            }
        }
        if self.artifacts > 0 {
            let _ = writeln!(out, "artifacts: {}", self.artifacts);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::state_store::MemoryStateStore;
    use crate::state::StepRun;
    use crate::test_support::{fixed_now, two_step_state};

    fn blocked_state() -> SequencerState {
        let mut state = two_step_state(0);
        state.step_runs.insert(
            "step-1".to_string(),
            StepRun {
                status: StepStatus::Failed,
                tries: 2,
                error: Some("exit 1\nmore detail".to_string()),
                ..StepRun::default()
            },
        );
        state.blockers.insert("step-1".to_string());
        state
    }

    #[test]
    fn unblock_resets_step_and_tries() {
        let store = MemoryStateStore::with_state("plan", &blocked_state()).expect("store");

        let state = unblock(&store, "step-1", false).expect("unblock");

        assert!(state.blockers.is_empty());
        let run = state.run_of("step-1");
        assert_eq!(run.status, StepStatus::Pending);
        assert_eq!(run.tries, 0);
        assert_eq!(store.load().expect("load"), Some(state));
    }

    #[test]
    fn unblock_can_keep_tries() {
        let store = MemoryStateStore::with_state("plan", &blocked_state()).expect("store");
        let state = unblock(&store, "step-1", true).expect("unblock");
        assert_eq!(state.run_of("step-1").tries, 2);
    }

    #[test]
    fn unblock_rejects_unknown_and_healthy_steps() {
        let store = MemoryStateStore::with_state("plan", &blocked_state()).expect("store");

        let err = unblock(&store, "step-9", false).expect_err("unknown");
        assert!(err.downcast_ref::<StepNotFoundError>().is_some());

        let err = unblock(&store, "step-2", false).expect_err("healthy");
        assert!(err.to_string().contains("neither blocked nor failed"));
    }

    #[test]
    fn unblock_without_plan_reports_no_plan() {
        let store = MemoryStateStore::new("empty");
        let err = unblock(&store, "step-1", false).expect_err("no plan");
        assert!(err.downcast_ref::<NoPlanError>().is_some());
    }

    #[test]
    fn add_artifact_dedupes() {
        let store = MemoryStateStore::with_state("plan", &two_step_state(0)).expect("store");
        add_artifact(&store, "step-1", "out/a.md").expect("add");
        let state = add_artifact(&store, "step-1", " out/a.md ").expect("add again");
        assert_eq!(state.artifacts["step-1"], vec!["out/a.md".to_string()]);
    }

    #[test]
    fn archive_label_is_compact_utc() {
        assert_eq!(archive_label(fixed_now()), "20260101T090000Z");
    }

    #[test]
    fn status_report_marks_blocked_current_step() {
        let mut state = blocked_state();
        state.last_heartbeat_iso = Some(fixed_now());
        let report = StatusReport::from_state("memory:plan", &state);

        assert!(report.is_blocked());
        let text = report.render();
        assert!(text.contains(">  1. step-1 [FAILED] tries=2 BLOCKED"));
        assert!(text.contains("error: exit 1"));
        assert!(!text.contains("more detail"));
        assert!(text.contains("status: IN_PROGRESS (0/2 steps done)"));
    }
}
