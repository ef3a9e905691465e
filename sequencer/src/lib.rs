//! Durable, crash-resumable step sequencer.
//!
//! A planning agent authors a plan once: named steps plus an execution order.
//! The sequencer then drives it to completion one step at a time across many
//! short-lived invocations, persisting everything it knows in a single state
//! document so any invocation can pick up where the last one stopped.
//!
//! - **[`core`]**: Pure, deterministic logic (the decision engine, invariants,
//!   inter-step pacing). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (state store, executor processes,
//!   prompts, config, attempt logs). Isolated behind traits for tests.
//!
//! Orchestration modules ([`check`], [`runner`], [`heartbeat`], [`plan`],
//! [`admin`]) coordinate core logic with I/O to implement CLI commands.

pub mod admin;
pub mod check;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod heartbeat;
pub mod io;
pub mod logging;
pub mod plan;
pub mod runner;
pub mod state;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
