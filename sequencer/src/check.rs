//! One decision engine evaluation against a store: load, decide, commit.

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::core::decision::decide;
use crate::core::types::{Action, Halt};
use crate::io::clock::Clock;
use crate::io::state_store::{StateStore, commit_if_current};

/// Evaluate the persisted state once and commit the resulting transition.
///
/// Always reloads; never trusts a state read by an earlier invocation. A DONE
/// or absent state is never written. Losing a commit race to another writer
/// is reported as `NoOp(Stale)` rather than an error.
#[instrument(skip_all, fields(store = %store.location(), max_retries))]
pub fn check(store: &dyn StateStore, max_retries: u32, clock: &dyn Clock) -> Result<Action> {
    let Some(before) = store.load()? else {
        debug!("no plan persisted");
        return Ok(Action::no_op(Halt::NoPlan));
    };
    if before.is_done() {
        debug!("plan already done");
        return Ok(Action::no_op(Halt::Completed));
    }

    let mut after = before.clone();
    let action = decide(&mut after, max_retries, clock.now());

    if !commit_if_current(store, &before, &after)? {
        info!("state changed underneath this check; standing down");
        return Ok(Action::no_op(Halt::Stale));
    }

    info!(
        action = %action.label(),
        current_step = after.current_step,
        status = ?after.status,
        "check decided"
    );
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::core::types::StepTarget;
    use crate::io::state_store::MemoryStateStore;
    use crate::state::{SequencerState, SequencerStatus, StepRun, StepStatus};
    use crate::test_support::{ManualClock, fixed_now, two_step_state};

    /// Store that hand-edits its document right after the first load, as a
    /// human or second heartbeat would between `check`'s read and its commit.
    struct EditedAfterLoad {
        inner: MemoryStateStore,
        edit: String,
        edited: Cell<bool>,
    }

    impl StateStore for EditedAfterLoad {
        fn location(&self) -> String {
            self.inner.location()
        }

        fn load(&self) -> Result<Option<SequencerState>> {
            let loaded = self.inner.load();
            if !self.edited.replace(true) {
                self.inner.put_raw(self.edit.clone());
            }
            loaded
        }

        fn save(&self, state: &SequencerState) -> Result<()> {
            self.inner.save(state)
        }
    }

    #[test]
    fn absent_state_is_a_noop() {
        let store = MemoryStateStore::new("empty");
        let clock = ManualClock::new(fixed_now());
        let action = check(&store, 3, &clock).expect("check");
        assert_eq!(action, Action::no_op(Halt::NoPlan));
        assert!(store.raw().is_none());
    }

    #[test]
    fn done_state_is_left_byte_identical() {
        let mut state = two_step_state(0);
        for id in ["step-1", "step-2"] {
            state.step_runs.insert(
                id.to_string(),
                StepRun {
                    status: StepStatus::Done,
                    ..StepRun::default()
                },
            );
        }
        state.current_step = 2;
        state.status = SequencerStatus::Done;
        let store = MemoryStateStore::with_state("done", &state).expect("store");
        let raw_before = store.raw();
        let clock = ManualClock::new(fixed_now());

        for _ in 0..3 {
            let action = check(&store, 3, &clock).expect("check");
            assert_eq!(action, Action::no_op(Halt::Completed));
        }
        assert_eq!(store.raw(), raw_before);
    }

    #[test]
    fn commits_heartbeat_and_transition() {
        let store = MemoryStateStore::with_state("plan", &two_step_state(0)).expect("store");
        let clock = ManualClock::new(fixed_now());

        let action = check(&store, 3, &clock).expect("check");
        assert_eq!(
            action.target(),
            Some(&StepTarget {
                index: 0,
                step_id: "step-1".to_string(),
                tries: 0,
            })
        );
        let saved = store.load().expect("load").expect("state");
        assert_eq!(saved.last_heartbeat_iso, Some(fixed_now()));
    }

    #[test]
    fn lost_commit_race_is_stale_and_keeps_the_newer_state() {
        let mut edited = two_step_state(0);
        edited.blockers.insert("step-1".to_string());
        let edit = serde_json::to_string(&edited).expect("serialize");
        let store = EditedAfterLoad {
            inner: MemoryStateStore::with_state("plan", &two_step_state(0)).expect("store"),
            edit: edit.clone(),
            edited: Cell::new(false),
        };
        let clock = ManualClock::new(fixed_now());

        let action = check(&store, 3, &clock).expect("check");

        assert_eq!(action, Action::no_op(Halt::Stale));
        assert_eq!(store.inner.raw(), Some(edit));
    }
}
