//! Stable exit codes for sequencer CLI commands.

/// Command succeeded, or the plan made progress / has work left.
pub const OK: i32 = 0;
/// Command failed due to invalid state, config, arguments or other errors.
pub const INVALID: i32 = 1;
/// The plan is DONE.
pub const COMPLETE: i32 = 2;
/// The current step is blocked and awaits `unblock`.
pub const BLOCKED: i32 = 3;
