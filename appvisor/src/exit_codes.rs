//! Stable exit codes for appvisor CLI commands.

/// Command succeeded; for `fix`, the app reported no errors afterwards.
pub const OK: i32 = 0;
/// Invalid config, spawn failure or any other error.
pub const FAILED: i32 = 1;
/// `appvisor fix` ran out of attempts with errors remaining.
pub const ERRORS_REMAIN: i32 = 2;
/// The dev server crashed or never became ready.
pub const CRASHED: i32 = 3;
