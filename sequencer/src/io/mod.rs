//! I/O helpers for sequencer commands.

pub mod attempt_log;
pub mod clock;
pub mod config;
pub mod executor;
pub mod init;
pub mod process;
pub mod prompt;
pub mod state_store;
