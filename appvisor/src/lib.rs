//! Runtime orchestration for locally developed web apps.
//!
//! The crate runs an app's dev server, fronts it with a reverse proxy, classifies its output
//! into error reports, drives a bounded agent repair loop and hosts interactive shells scoped
//! to the app. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (types, output classification, readiness and
//!   directive parsing). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (config files, child processes, ports, the proxy
//!   worker, agent backends, file edits).
//!
//! Registries ([`supervisor`], [`detector`], [`fix`], [`terminal`]) coordinate core logic
//! with I/O and publish everything observable on the [`events`] bus. [`host::Host`] owns one
//! of each.

pub mod core;
pub mod detector;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod fix;
pub mod host;
pub mod io;
pub mod logging;
pub mod supervisor;
pub mod terminal;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
