//! Typed errors that callers recover from via `anyhow::Error::downcast_ref`.
//!
//! Everything else travels as plain `anyhow::Error` with context attached.

use thiserror::Error;

/// The persisted state is malformed or internally inconsistent.
///
/// Fatal to the current invocation; the stored document is left untouched.
#[derive(Debug, Error)]
#[error("invalid sequencer state at {location}:\n- {}", .violations.join("\n- "))]
pub struct SchemaError {
    pub location: String,
    pub violations: Vec<String>,
}

/// A compare-and-swap commit lost against a concurrent writer.
#[derive(Debug, Error)]
#[error("state at {location} changed since it was loaded")]
pub struct StaleStateError {
    pub location: String,
}

/// An operation referenced a step the plan does not define.
#[derive(Debug, Error)]
#[error("step '{step_id}' is not defined in the plan")]
pub struct StepNotFoundError {
    pub step_id: String,
}

/// No plan is persisted where one is required.
#[derive(Debug, Error)]
#[error("no plan found at {location}")]
pub struct NoPlanError {
    pub location: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_lists_every_violation() {
        let err = SchemaError {
            location: "state.json".to_string(),
            violations: vec!["first".to_string(), "second".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("state.json"));
        assert!(msg.contains("- first"));
        assert!(msg.contains("- second"));
    }
}
