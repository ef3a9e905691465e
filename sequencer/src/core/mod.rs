//! Deterministic, pure logic shared by the sequencer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! state and return deterministic outputs suitable for tests.

pub mod decision;
pub mod delay;
pub mod invariants;
pub mod types;
