//! Heartbeat adapter: the periodic trigger that drives the decision engine.
//!
//! A tick evaluates the state, hands any chosen step to the runner, and keeps
//! re-evaluating for as long as the runner reports finished attempts, so a
//! plan advances without waiting for the next external trigger. `watch` is
//! the long-running form: ticks at a fixed interval until the plan completes
//! or blocks.

use std::sync::mpsc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::check::check;
use crate::core::types::{Action, Halt, StepEvent};
use crate::io::clock::Clock;
use crate::io::state_store::StateStore;
use crate::runner::Runner;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Every decision taken during the tick, in order.
    pub actions: Vec<Action>,
    /// Every runner event received during the tick, in order.
    pub events: Vec<StepEvent>,
    /// Why the tick stopped re-evaluating, when the engine halted.
    pub halt: Option<Halt>,
    /// Set when the tick ended waiting for the inter-step delay.
    pub deferred_until: Option<DateTime<Utc>>,
}

impl TickReport {
    pub fn attempts(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, StepEvent::Finished { .. }))
            .count()
    }
}

/// Why [`Heartbeat::watch`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStop {
    Completed,
    Blocked,
    /// The configured tick limit was reached first.
    TickLimit,
}

pub struct Heartbeat<'a> {
    store: &'a dyn StateStore,
    runner: &'a dyn Runner,
    clock: &'a dyn Clock,
    max_retries: u32,
}

impl<'a> Heartbeat<'a> {
    pub fn new(
        store: &'a dyn StateStore,
        runner: &'a dyn Runner,
        clock: &'a dyn Clock,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            runner,
            clock,
            max_retries,
        }
    }

    /// One heartbeat: evaluate, run, and re-evaluate while attempts finish.
    #[instrument(skip_all, fields(store = %self.store.location()))]
    pub fn tick(&self) -> Result<TickReport> {
        let (tx, rx) = mpsc::channel();
        let mut report = TickReport::default();
        loop {
            let action = check(self.store, self.max_retries, self.clock)?;
            let target = action.target().cloned();
            report.halt = action.halt();
            report.actions.push(action);
            let Some(target) = target else {
                break;
            };

            self.runner.run(self.store, &target, &tx)?;

            let mut reevaluate = false;
            for event in rx.try_iter() {
                match &event {
                    StepEvent::Finished { .. } | StepEvent::Superseded { .. } => reevaluate = true,
                    StepEvent::Deferred { until, .. } => report.deferred_until = Some(*until),
                }
                report.events.push(event);
            }
            if !reevaluate {
                break;
            }
            debug!("attempt finished; re-evaluating");
        }
        info!(
            decisions = report.actions.len(),
            attempts = report.attempts(),
            halt = ?report.halt,
            "tick finished"
        );
        Ok(report)
    }

    /// Tick every `interval` until the plan completes or blocks.
    ///
    /// `max_ticks` bounds the loop; `None` runs until a terminal halt.
    /// `on_tick` observes each report as it happens.
    pub fn watch<F: FnMut(&TickReport)>(
        &self,
        interval: Duration,
        max_ticks: Option<u64>,
        mut on_tick: F,
    ) -> Result<WatchStop> {
        let mut ticks = 0u64;
        loop {
            let report = self.tick()?;
            ticks += 1;
            on_tick(&report);
            match report.halt {
                Some(Halt::Completed) => return Ok(WatchStop::Completed),
                Some(Halt::Blocked) => return Ok(WatchStop::Blocked),
                _ => {}
            }
            if max_ticks.is_some_and(|max| ticks >= max) {
                return Ok(WatchStop::TickLimit);
            }
            self.clock.sleep(self.next_wait(&report, interval));
        }
    }

    /// Sleep until the deferred start when that comes before the next interval.
    fn next_wait(&self, report: &TickReport, interval: Duration) -> Duration {
        report
            .deferred_until
            .and_then(|until| (until - self.clock.now()).to_std().ok())
            .filter(|wait| *wait < interval)
            .unwrap_or(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StepOutcome;
    use crate::io::config::DelayMode;
    use crate::io::state_store::MemoryStateStore;
    use crate::runner::StepRunner;
    use crate::state::StepStatus;
    use crate::test_support::{
        ManualClock, ScriptedExec, ScriptedExecutor, fixed_now, single_step_state, two_step_state,
    };

    #[test]
    fn tick_without_plan_does_nothing() {
        let store = MemoryStateStore::new("empty");
        let clock = ManualClock::new(fixed_now());
        let executor = ScriptedExecutor::new(Vec::new());
        let runner = StepRunner::new(&executor, &clock, ".");

        let report = Heartbeat::new(&store, &runner, &clock, 3)
            .tick()
            .expect("tick");

        assert_eq!(report.halt, Some(Halt::NoPlan));
        assert!(report.events.is_empty());
    }

    /// Verifies one tick chains through every step when each attempt succeeds.
    #[test]
    fn tick_self_chains_to_completion() {
        let store = MemoryStateStore::with_state("plan", &two_step_state(0)).expect("store");
        let clock = ManualClock::new(fixed_now());
        let executor = ScriptedExecutor::new(vec![ScriptedExec::ok(), ScriptedExec::ok()]);
        let runner = StepRunner::new(&executor, &clock, ".");

        let report = Heartbeat::new(&store, &runner, &clock, 3)
            .tick()
            .expect("tick");

        assert_eq!(report.halt, Some(Halt::Completed));
        assert_eq!(report.attempts(), 2);
        assert_eq!(executor.prompts(), vec!["one".to_string(), "two".to_string()]);
        let state = store.load().expect("load").expect("state");
        assert!(state.is_done());
        assert_eq!(state.current_step, 2);
    }

    #[test]
    fn tick_retries_until_blocked() {
        let store = MemoryStateStore::with_state("plan", &single_step_state()).expect("store");
        let clock = ManualClock::new(fixed_now());
        let executor = ScriptedExecutor::new(vec![
            ScriptedExec::fail("one"),
            ScriptedExec::fail("two"),
            ScriptedExec::fail("three"),
        ]);
        let runner = StepRunner::new(&executor, &clock, ".");

        let report = Heartbeat::new(&store, &runner, &clock, 3)
            .tick()
            .expect("tick");

        assert_eq!(report.halt, Some(Halt::Blocked));
        assert_eq!(report.attempts(), 3);
        assert_eq!(executor.remaining(), 0);
        let state = store.load().expect("load").expect("state");
        assert!(state.blockers.contains("step-1"));
        assert_eq!(state.run_of("step-1").status, StepStatus::Failed);
        assert_eq!(state.run_of("step-1").tries, 2);
    }

    #[test]
    fn deferred_tick_stops_and_watch_resumes_after_delay() {
        let store = MemoryStateStore::with_state("plan", &two_step_state(2)).expect("store");
        let clock = ManualClock::new(fixed_now());
        let executor = ScriptedExecutor::new(vec![ScriptedExec::ok(), ScriptedExec::ok()]);
        let runner = StepRunner::new(&executor, &clock, ".").with_delay_mode(DelayMode::Defer);
        let heartbeat = Heartbeat::new(&store, &runner, &clock, 3);

        let first = heartbeat.tick().expect("tick");
        assert_eq!(first.attempts(), 1);
        assert_eq!(
            first.deferred_until,
            Some(fixed_now() + chrono::Duration::minutes(2))
        );
        assert_eq!(first.halt, None);

        let mut reports = Vec::new();
        let stop = heartbeat
            .watch(Duration::from_secs(600), Some(5), |r| reports.push(r.clone()))
            .expect("watch");

        assert_eq!(stop, WatchStop::Completed);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(120)]);
        assert!(reports.iter().any(|r| r.events.iter().any(|e| matches!(
            e,
            StepEvent::Finished {
                outcome: StepOutcome::Succeeded { .. },
                ..
            }
        ))));
    }

    #[test]
    fn watch_stops_at_tick_limit() {
        let store = MemoryStateStore::new("empty");
        let clock = ManualClock::new(fixed_now());
        let executor = ScriptedExecutor::new(Vec::new());
        let runner = StepRunner::new(&executor, &clock, ".");

        let stop = Heartbeat::new(&store, &runner, &clock, 3)
            .watch(Duration::from_secs(60), Some(2), |_| {})
            .expect("watch");

        assert_eq!(stop, WatchStop::TickLimit);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(60)]);
    }
}
