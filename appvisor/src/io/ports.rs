//! Local TCP port allocation.

use std::net::{Ipv4Addr, TcpListener};

use tracing::{debug, warn};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Return the first port in `start..=end` that can currently be bound on loopback.
///
/// Each candidate is probed once, so this terminates after at most `end - start + 1` binds.
/// The probe listener is dropped before returning; callers bind immediately after.
pub fn allocate(start: u16, end: u16) -> OrchestratorResult<u16> {
    allocate_from(start, end, start)
}

/// Like [`allocate`], but probe `first..=end` before wrapping around to `start..first`.
///
/// Rotating `first` keeps a restarted listener off the port its predecessor just released.
pub fn allocate_from(start: u16, end: u16, first: u16) -> OrchestratorResult<u16> {
    if start == 0 || start > end {
        return Err(OrchestratorError::PortExhausted { start, end });
    }
    let first = first.clamp(start, end);
    for port in (first..=end).chain(start..first) {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => {
                drop(listener);
                debug!(port, "allocated port");
                return Ok(port);
            }
            Err(e) => debug!(port, err = %e, "port unavailable"),
        }
    }
    warn!(start, end, "port range exhausted");
    Err(OrchestratorError::PortExhausted { start, end })
}

/// Whether `port` is bindable on loopback right now.
pub fn is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
