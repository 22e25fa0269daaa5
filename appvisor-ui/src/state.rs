//! Shared application state for the host service.

use std::sync::Arc;

use appvisor::host::Host;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The orchestrator every route drives.
    pub host: Arc<Host>,
}

impl AppState {
    pub fn new(host: Arc<Host>) -> Self {
        Self { host }
    }
}
