//! Test-only helpers: deterministic states, a manual clock and scripted executors.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};

use crate::core::types::StepOutcome;
use crate::io::clock::Clock;
use crate::io::executor::{ExecReport, ExecRequest, Executor};
use crate::io::init::{DEFAULT_PLAN_ID, SequencerPaths};
use crate::io::state_store::{FileStateStore, StateStore};
use crate::state::{Plan, SequencerState, Step};

/// A fixed instant used wherever a test needs "now".
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Build a fresh plan state from `(id, title, instruction)` triples, queued in order.
pub fn state_with_steps(steps: &[(&str, &str, &str)], delay_minutes: u32) -> SequencerState {
    let mut defs = BTreeMap::new();
    for (id, title, instruction) in steps {
        defs.insert(
            (*id).to_string(),
            Step {
                title: (*title).to_string(),
                instruction: (*instruction).to_string(),
            },
        );
    }
    let queue = steps.iter().map(|(id, _, _)| (*id).to_string()).collect();
    SequencerState::new(Plan { steps: defs }, queue, delay_minutes)
}

/// One-step plan: `step-1`.
pub fn single_step_state() -> SequencerState {
    state_with_steps(&[("step-1", "Only", "do the only thing")], 0)
}

/// Two-step plan: `step-1` then `step-2`, with the given inter-step delay.
pub fn two_step_state(delay_minutes: u32) -> SequencerState {
    state_with_steps(
        &[("step-1", "First", "one"), ("step-2", "Second", "two")],
        delay_minutes,
    )
}

/// A file-backed plan under `<tempdir>/.sequencer/default/`, removed on drop.
pub struct TempPlan {
    dir: tempfile::TempDir,
    pub store: FileStateStore,
}

impl TempPlan {
    pub fn new(state: &SequencerState) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let store = FileStateStore::new(SequencerPaths::new(dir.path()).plan(DEFAULT_PLAN_ID)?);
        store.save(state)?;
        Ok(Self { dir, store })
    }

    /// Project root (the directory containing `.sequencer/`).
    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// Clock whose time only moves when a test (or a sleep) moves it.
///
/// Clones share the same underlying instant so an executor can advance the
/// clock the runner reads from.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<DateTime<Utc>>>,
    slept: Rc<RefCell<Vec<Duration>>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Rc::new(Cell::new(now)),
            slept: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.now.set(self.now.get() + by);
    }

    /// Every duration passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
        if let Ok(delta) = chrono::Duration::from_std(duration) {
            self.advance(delta);
        }
    }
}

/// One scripted executor response.
#[derive(Debug, Clone)]
pub enum ScriptedExec {
    Succeed(Vec<String>),
    Fail(String),
    /// The executor could not be started at all.
    SpawnError(String),
}

impl ScriptedExec {
    pub fn ok() -> Self {
        ScriptedExec::Succeed(Vec::new())
    }

    pub fn fail(error: &str) -> Self {
        ScriptedExec::Fail(error.to_string())
    }
}

/// Executor that replays a queue of responses and records every request.
#[derive(Debug)]
pub struct ScriptedExecutor {
    script: RefCell<VecDeque<ScriptedExec>>,
    requests: RefCell<Vec<ExecRequest>>,
    clock: Option<ManualClock>,
    elapsed: chrono::Duration,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<ScriptedExec>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            requests: RefCell::new(Vec::new()),
            clock: None,
            elapsed: chrono::Duration::zero(),
        }
    }

    /// Advance `clock` by `elapsed` on every invocation, simulating work time.
    pub fn with_clock(mut self, clock: &ManualClock, elapsed: chrono::Duration) -> Self {
        self.clock = Some(clock.clone());
        self.elapsed = elapsed;
        self
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.borrow().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.script.borrow().len()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecReport> {
        self.requests.borrow_mut().push(request.clone());
        if let Some(clock) = &self.clock {
            clock.advance(self.elapsed);
        }
        let next = self
            .script
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted executor exhausted at {}", request.step_id))?;
        let outcome = match next {
            ScriptedExec::Succeed(artifacts) => StepOutcome::Succeeded { artifacts },
            ScriptedExec::Fail(error) => StepOutcome::Failed { error },
            ScriptedExec::SpawnError(message) => return Err(anyhow!(message)),
        };
        Ok(ExecReport {
            outcome,
            transcript: Some(format!("scripted attempt for {}\n", request.step_id)),
        })
    }
}
