//! Inter-step pacing.
//!
//! The wait is measured from the previous step's `finishedAt` rather than
//! from "now", so a process restart in the middle of a wait resumes with the
//! time that is actually left instead of starting over.

use chrono::{DateTime, Duration, Utc};

use crate::state::{SequencerState, StepStatus};

/// Earliest instant at which step `index` may start its first attempt.
///
/// Returns `None` when no pacing applies: the first step, a zero delay, a
/// retry (`tries > 0`), a step already started, or a predecessor with no
/// recorded finish time.
pub fn not_before(state: &SequencerState, index: usize) -> Option<DateTime<Utc>> {
    if index == 0 || state.step_delay_minutes == 0 {
        return None;
    }
    let step_id = state.step_queue.get(index)?;
    let run = state.run_of(step_id);
    if run.tries > 0 || run.status != StepStatus::Pending {
        return None;
    }
    let previous = state.step_queue.get(index - 1)?;
    let finished_at = state.step_runs.get(previous)?.finished_at?;
    Some(finished_at + Duration::minutes(i64::from(state.step_delay_minutes)))
}

/// Time still to wait before step `index` may start, or `None` if it may start now.
pub fn remaining(
    state: &SequencerState,
    index: usize,
    now: DateTime<Utc>,
) -> Option<std::time::Duration> {
    let not_before = not_before(state, index)?;
    (not_before - now).to_std().ok().filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StepRun;
    use crate::test_support::{fixed_now, two_step_state};

    fn finished_first_step(delay: u32, finished_ago_secs: i64) -> SequencerState {
        let mut state = two_step_state(delay);
        state.step_runs.insert(
            "step-1".to_string(),
            StepRun {
                status: StepStatus::Done,
                finished_at: Some(fixed_now() - Duration::seconds(finished_ago_secs)),
                ..StepRun::default()
            },
        );
        state.current_step = 1;
        state
    }

    #[test]
    fn waits_the_full_delay_right_after_previous_step() {
        let state = finished_first_step(2, 0);
        assert_eq!(
            remaining(&state, 1, fixed_now()),
            Some(std::time::Duration::from_secs(120))
        );
    }

    #[test]
    fn resumes_with_only_the_time_left_after_restart() {
        let state = finished_first_step(2, 90);
        assert_eq!(
            remaining(&state, 1, fixed_now()),
            Some(std::time::Duration::from_secs(30))
        );
    }

    #[test]
    fn no_wait_once_delay_has_elapsed() {
        let state = finished_first_step(2, 600);
        assert_eq!(remaining(&state, 1, fixed_now()), None);
    }

    #[test]
    fn zero_delay_and_first_step_never_wait() {
        let state = finished_first_step(0, 0);
        assert_eq!(remaining(&state, 1, fixed_now()), None);
        let state = finished_first_step(2, 0);
        assert_eq!(remaining(&state, 0, fixed_now()), None);
    }

    #[test]
    fn retries_are_not_paced() {
        let mut state = finished_first_step(2, 0);
        state.step_runs.insert(
            "step-2".to_string(),
            StepRun {
                status: StepStatus::Pending,
                tries: 1,
                ..StepRun::default()
            },
        );
        assert_eq!(remaining(&state, 1, fixed_now()), None);
    }
}
