//! Persisted plan and run-history model (`state.json`).
//!
//! Field names serialize in camelCase so the document stays readable and
//! editable by the planning agent and by humans doing manual intervention.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single unit of work in a plan.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub title: String,
    pub instruction: String,
}

/// Step definitions authored once per task. Never mutated after persistence.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub steps: BTreeMap<String, Step>,
}

/// Overall lifecycle of a sequencer state.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SequencerStatus {
    InProgress,
    Done,
}

/// Lifecycle of a single step run.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::InProgress => "IN_PROGRESS",
            StepStatus::Done => "DONE",
            StepStatus::Failed => "FAILED",
        }
    }
}

/// Run record for one step.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StepRun {
    pub status: StepStatus,
    /// Number of FAILED -> PENDING transitions (0 on the first attempt).
    #[serde(default)]
    pub tries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// The single persisted aggregate for one multi-step task.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SequencerState {
    pub plan: Plan,
    /// Authoritative execution order.
    pub step_queue: Vec<String>,
    /// Index into `step_queue`; equals `step_queue.len()` once `status` is DONE.
    pub current_step: usize,
    #[serde(default)]
    pub step_runs: BTreeMap<String, StepRun>,
    #[serde(default)]
    pub step_delay_minutes: u32,
    pub status: SequencerStatus,
    #[serde(default)]
    pub blockers: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_iso: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Vec<String>>,
}

impl SequencerState {
    /// Fresh state for a newly authored plan: every step PENDING, nothing run yet.
    pub fn new(plan: Plan, step_queue: Vec<String>, step_delay_minutes: u32) -> Self {
        Self {
            plan,
            step_queue,
            current_step: 0,
            step_runs: BTreeMap::new(),
            step_delay_minutes,
            status: SequencerStatus::InProgress,
            blockers: BTreeSet::new(),
            last_heartbeat_iso: None,
            artifacts: BTreeMap::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == SequencerStatus::Done
    }

    /// Id of the step at `current_step`, if the queue is not exhausted.
    pub fn current_step_id(&self) -> Option<&str> {
        self.step_queue.get(self.current_step).map(String::as_str)
    }

    /// Run record for `step_id`, defaulting to PENDING with zero tries.
    pub fn run_of(&self, step_id: &str) -> StepRun {
        self.step_runs.get(step_id).cloned().unwrap_or_default()
    }

    pub fn run_mut(&mut self, step_id: &str) -> &mut StepRun {
        self.step_runs.entry(step_id.to_string()).or_default()
    }

    /// Append artifact references under `key`, skipping ones already recorded.
    pub fn add_artifacts<I>(&mut self, key: &str, references: I)
    where
        I: IntoIterator<Item = String>,
    {
        let entry = self.artifacts.entry(key.to_string()).or_default();
        for reference in references {
            if !entry.contains(&reference) {
                entry.push(reference);
            }
        }
        if entry.is_empty() {
            self.artifacts.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_document_with_defaults() {
        let raw = r#"{
            "plan": {"steps": {"step-1": {"title": "First", "instruction": "one"}}},
            "stepQueue": ["step-1"],
            "currentStep": 0,
            "status": "IN_PROGRESS"
        }"#;
        let state: SequencerState = serde_json::from_str(raw).expect("parse");
        assert_eq!(state.step_delay_minutes, 0);
        assert!(state.step_runs.is_empty());
        assert!(state.blockers.is_empty());
        assert_eq!(state.run_of("step-1"), StepRun::default());
    }

    #[test]
    fn step_run_serializes_screaming_status_and_skips_empty_fields() {
        let run = StepRun {
            status: StepStatus::InProgress,
            tries: 2,
            ..StepRun::default()
        };
        let json = serde_json::to_string(&run).expect("serialize");
        assert_eq!(json, r#"{"status":"IN_PROGRESS","tries":2}"#);
    }

    #[test]
    fn add_artifacts_accumulates_without_duplicates() {
        let mut state = SequencerState::new(Plan::default(), Vec::new(), 0);
        state.add_artifacts("step-1", vec!["out/a.md".to_string()]);
        state.add_artifacts(
            "step-1",
            vec!["out/a.md".to_string(), "out/b.md".to_string()],
        );
        assert_eq!(state.artifacts["step-1"], vec!["out/a.md", "out/b.md"]);

        state.add_artifacts("step-2", Vec::new());
        assert!(!state.artifacts.contains_key("step-2"));
    }
}
