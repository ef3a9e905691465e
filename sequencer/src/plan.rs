//! Planning agent intake: turn an authored plan into a fresh persisted state.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::core::invariants::validate_invariants;
use crate::error::SchemaError;
use crate::io::state_store::StateStore;
use crate::state::{Plan, SequencerState};

/// The document a planning agent hands over: step definitions plus order.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanRequest {
    pub plan: Plan,
    pub step_queue: Vec<String>,
    #[serde(default)]
    pub step_delay_minutes: u32,
}

impl PlanRequest {
    pub fn into_state(self) -> SequencerState {
        SequencerState::new(self.plan, self.step_queue, self.step_delay_minutes)
    }

    /// Fresh state for this plan, or the invariant violations it would persist.
    pub fn into_checked_state(self, location: &str) -> Result<SequencerState, SchemaError> {
        let state = self.into_state();
        let errors = validate_invariants(&state);
        if !errors.is_empty() {
            return Err(SchemaError {
                location: location.to_string(),
                violations: errors,
            });
        }
        Ok(state)
    }
}

pub fn load_plan_request(path: &Path) -> Result<PlanRequest> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse plan {}", path.display()))
}

/// Persist a fresh state for `request`.
///
/// An existing IN_PROGRESS state is only replaced when `force` is set; a DONE
/// state is replaced freely. Unreadable existing documents also require
/// `force`.
#[instrument(skip_all, fields(store = %store.location(), steps = request.step_queue.len()))]
pub fn persist_plan(
    store: &dyn StateStore,
    request: PlanRequest,
    force: bool,
) -> Result<SequencerState> {
    let state = request.into_checked_state(&store.location())?;

    match store.load() {
        Ok(Some(existing)) if !existing.is_done() && !force => {
            return Err(anyhow!(
                "a plan is already in progress at {} (step {} of {}); pass --force to replace it",
                store.location(),
                existing.current_step + 1,
                existing.step_queue.len()
            ));
        }
        Ok(Some(existing)) if !existing.is_done() => {
            warn!(
                current_step = existing.current_step,
                "replacing an in-progress plan"
            );
        }
        Ok(_) => {}
        Err(err) if force => {
            warn!(error = %format!("{err:#}"), "replacing unreadable state");
        }
        Err(err) => return Err(err.context("existing state is unreadable; pass --force to replace it")),
    }

    store.save(&state)?;
    info!("plan persisted");
    Ok(state)
}
