//! Shared deterministic types for sequencer core logic.
//!
//! These types define stable contracts between the decision engine, the step
//! runner and the heartbeat adapter. They carry no I/O handles.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why the decision engine chose not to invoke anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Halt {
    /// No plan is persisted at the store location.
    NoPlan,
    /// The plan is DONE (either already, or as a result of this evaluation).
    Completed,
    /// The current step exhausted its retry budget and awaits intervention.
    Blocked,
    /// Another invocation changed the state first; this one stood down.
    Stale,
}

/// The step the runner should attempt next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepTarget {
    /// Index into `stepQueue`.
    pub index: usize,
    pub step_id: String,
    /// `tries` at the time of invocation; > 0 selects the troubleshoot prompt.
    pub tries: u32,
}

/// Output of one decision engine evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    NoOp {
        halt: Halt,
    },
    /// `currentStep` moved from `from` to `to`; `then` is the evaluation of
    /// the newly current step.
    Advance {
        from: usize,
        to: usize,
        then: Box<Action>,
    },
    /// A FAILED step was reset to PENDING with `tries` bumped.
    Retry {
        target: StepTarget,
    },
    /// Run (or re-run after a crash) the current step.
    InvokeCurrent {
        target: StepTarget,
    },
}

impl Action {
    pub fn no_op(halt: Halt) -> Self {
        Action::NoOp { halt }
    }

    /// The step to invoke once every `Advance` is resolved, if any.
    pub fn target(&self) -> Option<&StepTarget> {
        match self {
            Action::NoOp { .. } => None,
            Action::Advance { then, .. } => then.target(),
            Action::Retry { target } | Action::InvokeCurrent { target } => Some(target),
        }
    }

    /// The halt reason once every `Advance` is resolved, if nothing is invoked.
    pub fn halt(&self) -> Option<Halt> {
        match self {
            Action::NoOp { halt } => Some(*halt),
            Action::Advance { then, .. } => then.halt(),
            Action::Retry { .. } | Action::InvokeCurrent { .. } => None,
        }
    }

    pub fn is_retry(&self) -> bool {
        match self {
            Action::Retry { .. } => true,
            Action::Advance { then, .. } => then.is_retry(),
            _ => false,
        }
    }

    /// Short label for logs and CLI output.
    pub fn label(&self) -> String {
        match self {
            Action::NoOp { halt } => format!("noop({halt:?})"),
            Action::Advance { from, to, then } => {
                format!("advance({from}->{to}) then {}", then.label())
            }
            Action::Retry { target } => format!("retry({} try {})", target.step_id, target.tries),
            Action::InvokeCurrent { target } => format!("invoke({})", target.step_id),
        }
    }
}

/// Terminal outcome of one executor attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded { artifacts: Vec<String> },
    Failed { error: String },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded { .. })
    }
}

/// Notification from the step runner back to whoever drives the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEvent {
    /// The outcome was persisted; the engine should re-evaluate now.
    Finished {
        step_id: String,
        outcome: StepOutcome,
    },
    /// The outcome was discarded because the state moved on during execution.
    Superseded { step_id: String },
    /// The inter-step delay has not elapsed; nothing ran.
    Deferred {
        step_id: String,
        until: DateTime<Utc>,
    },
}
