//! Prompt construction for executor invocations.
//!
//! First attempts receive the step instruction verbatim. Retries receive a
//! troubleshoot prompt rendered from `prompts/troubleshoot.md`.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::state::{SequencerState, Step};

const TROUBLESHOOT_TEMPLATE: &str = include_str!("prompts/troubleshoot.md");

#[derive(Debug, Clone, Serialize)]
struct StepContext<'a> {
    id: &'a str,
    title: &'a str,
    instruction: &'a str,
}

/// Everything needed to build the prompt for one attempt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub step_id: &'a str,
    pub step: &'a Step,
    /// `tries` at invocation time; 0 on the first attempt.
    pub tries: u32,
    /// Most recent recorded error for the step, if any.
    pub last_error: Option<&'a str>,
}

impl<'a> PromptInputs<'a> {
    /// Gather prompt inputs for `step_id` from the persisted state.
    pub fn from_state(state: &'a SequencerState, step_id: &'a str) -> Option<Self> {
        let step = state.plan.steps.get(step_id)?;
        let run = state.step_runs.get(step_id);
        Some(Self {
            step_id,
            step,
            tries: run.map_or(0, |r| r.tries),
            last_error: run.and_then(|r| r.error.as_deref()),
        })
    }
}

/// Build the prompt text for an attempt.
pub fn build_prompt(input: &PromptInputs<'_>) -> Result<String> {
    if input.tries == 0 {
        return Ok(input.step.instruction.clone());
    }
    let mut env = Environment::new();
    env.add_template("troubleshoot", TROUBLESHOOT_TEMPLATE)
        .context("load troubleshoot template")?;
    let template = env.get_template("troubleshoot")?;
    let rendered = template
        .render(context! {
            step => StepContext {
                id: input.step_id,
                title: &input.step.title,
                instruction: input.step.instruction.trim(),
            },
            tries => input.tries,
            error => input.last_error.map(str::trim).filter(|s| !s.is_empty()),
        })
        .context("render troubleshoot prompt")?;
    debug!(step_id = input.step_id, tries = input.tries, bytes = rendered.len(), "built troubleshoot prompt");
    Ok(rendered)
}
