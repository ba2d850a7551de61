//! Batch mutation testing of reflected game-engine types against a live
//! remote-protocol server.
//!
//! A controller plans batches of types into per-worker Plan Files; worker
//! processes pull operations one at a time and report results back. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (sequencing, packing, dedupe, log
//!   replay, coordinator transitions, aggregation). No I/O, fully testable.
//! - **[`io`]**: Side-effecting operations (config, catalog and plan storage,
//!   the shared Execution Log, the clock). Isolated behind traits where tests
//!   need doubles.
//!
//! Orchestration modules ([`prepare`], [`coordinate`], [`results`], [`status`],
//! [`validate`]) coordinate core logic with I/O to implement CLI commands.

pub mod coordinate;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod prepare;
pub mod results;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
