//! Development-time tracing for debugging the orchestrator.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the orchestrator's product output.
//!
//! - **Event bus (`events`)**: Output records, state changes and error reports for
//!   whatever renders them. Always published, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber, reading `RUST_LOG` and falling back to `default_filter`.
///
/// Output: stderr, compact format. Calling it twice is harmless; the second call is ignored.
///
/// # Example
/// ```bash
/// RUST_LOG=appvisor=debug appvisor run --app-id demo
/// ```
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
