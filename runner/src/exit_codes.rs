//! Stable exit codes for mutation-runner CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid layout/config/catalog/plan, malformed input or any other error.
pub const INVALID: i32 = 1;
/// `prepare` or `process-results` found nothing left to do.
pub const NOTHING_TO_TEST: i32 = 2;
