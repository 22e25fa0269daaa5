//! Pure, deterministic orchestrator logic. No I/O lives here.

pub mod classifier;
pub mod command;
pub mod directives;
pub mod ready;
pub mod types;
