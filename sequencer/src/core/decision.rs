//! The decision engine: given the persisted state, pick the next action.
//!
//! `decide` mutates the in-memory state with exactly the transition that must
//! be committed together with the returned [`Action`]. It performs no I/O, so
//! callers own loading, committing and invoking the runner.

use chrono::{DateTime, Utc};

use crate::core::types::{Action, Halt, StepTarget};
use crate::state::{SequencerState, SequencerStatus, StepStatus};

/// Evaluate `state` and apply the transition for the chosen action.
///
/// A DONE state is returned untouched. Every other evaluation stamps
/// `lastHeartbeatIso` with `now`.
pub fn decide(state: &mut SequencerState, max_retries: u32, now: DateTime<Utc>) -> Action {
    if state.is_done() {
        return Action::no_op(Halt::Completed);
    }
    let action = evaluate_current(state, max_retries);
    state.last_heartbeat_iso = Some(now);
    action
}

fn evaluate_current(state: &mut SequencerState, max_retries: u32) -> Action {
    let index = state.current_step;
    let Some(step_id) = state.current_step_id().map(str::to_owned) else {
        // Queue exhausted (or empty): nothing left to run.
        finish(state);
        return Action::no_op(Halt::Completed);
    };

    if state.blockers.contains(&step_id) {
        return Action::no_op(Halt::Blocked);
    }

    let run = state.run_of(&step_id);
    match run.status {
        StepStatus::Failed => {
            if failed_attempts(run.tries) >= max_retries {
                state.blockers.insert(step_id);
                return Action::no_op(Halt::Blocked);
            }
            let entry = state.run_mut(&step_id);
            entry.tries += 1;
            entry.status = StepStatus::Pending;
            Action::Retry {
                target: StepTarget {
                    index,
                    step_id,
                    tries: entry.tries,
                },
            }
        }
        StepStatus::Done => {
            if index + 1 >= state.step_queue.len() {
                finish(state);
                return Action::no_op(Halt::Completed);
            }
            state.current_step = index + 1;
            Action::Advance {
                from: index,
                to: index + 1,
                then: Box::new(evaluate_current(state, max_retries)),
            }
        }
        StepStatus::Pending | StepStatus::InProgress => Action::InvokeCurrent {
            target: StepTarget {
                index,
                step_id,
                tries: run.tries,
            },
        },
    }
}

/// Attempts that ended FAILED for a step currently in FAILED status.
///
/// `tries` counts FAILED -> PENDING resets, so the attempt that just failed
/// is one more than that.
fn failed_attempts(tries: u32) -> u32 {
    tries.saturating_add(1)
}

fn finish(state: &mut SequencerState) {
    state.current_step = state.step_queue.len();
    state.status = SequencerStatus::Done;
}
