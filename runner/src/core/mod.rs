//! Deterministic, pure logic shared by the runner core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod aggregate;
pub mod coordinator;
pub mod dedupe;
pub mod invariants;
pub mod log_event;
pub mod operation;
pub mod packing;
pub mod sequencer;
pub mod types;
pub mod value;
