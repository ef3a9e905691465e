//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::state::{SequencerState, SequencerStatus, StepStatus};

/// Inter-step delays a plan may request, in minutes.
pub const ALLOWED_STEP_DELAYS: [u32; 2] = [0, 2];

/// Check semantic invariants not expressible in JSON Schema:
/// - every `stepQueue` entry names a step in `plan.steps`, at most once
/// - `currentStep` equals the queue length when DONE, and is at most the
///   queue length while IN_PROGRESS. The cursor may sit at the queue end while
///   IN_PROGRESS (an empty queue, or a hand-edited state); the next check
///   finalizes that to DONE.
/// - at most one step is IN_PROGRESS
/// - `stepDelayMinutes` is one of the allowed values
/// - `stepRuns` keys and `blockers` name steps in the plan
pub fn validate_invariants(state: &SequencerState) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (index, step_id) in state.step_queue.iter().enumerate() {
        if !state.plan.steps.contains_key(step_id) {
            errors.push(format!(
                "stepQueue[{index}]: step '{step_id}' is not defined in plan.steps"
            ));
        }
        if !seen.insert(step_id.as_str()) {
            errors.push(format!("stepQueue[{index}]: duplicate step '{step_id}'"));
        }
    }

    let queue_len = state.step_queue.len();
    match state.status {
        SequencerStatus::InProgress if state.current_step > queue_len => {
            errors.push(format!(
                "currentStep {} is out of range for a queue of {queue_len}",
                state.current_step
            ));
        }
        SequencerStatus::Done if state.current_step != queue_len => {
            errors.push(format!(
                "currentStep {} must equal queue length {queue_len} when status is DONE",
                state.current_step
            ));
        }
        _ => {}
    }

    let in_progress: Vec<&str> = state
        .step_runs
        .iter()
        .filter(|(_, run)| run.status == StepStatus::InProgress)
        .map(|(id, _)| id.as_str())
        .collect();
    if in_progress.len() > 1 {
        errors.push(format!(
            "at most one step may be IN_PROGRESS, found: {}",
            in_progress.join(", ")
        ));
    }

    if !ALLOWED_STEP_DELAYS.contains(&state.step_delay_minutes) {
        errors.push(format!(
            "stepDelayMinutes must be one of {:?}, got {}",
            ALLOWED_STEP_DELAYS, state.step_delay_minutes
        ));
    }

    for step_id in state.step_runs.keys() {
        if !state.plan.steps.contains_key(step_id) {
            errors.push(format!("stepRuns: unknown step '{step_id}'"));
        }
    }
    for step_id in &state.blockers {
        if !state.plan.steps.contains_key(step_id) {
            errors.push(format!("blockers: unknown step '{step_id}'"));
        }
    }

    errors
}
