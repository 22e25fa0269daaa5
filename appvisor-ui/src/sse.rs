//! Server-Sent Events stream of runtime and terminal events.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::AppState;

fn event<T: Serialize>(name: &str, payload: &T) -> Option<Event> {
    match serde_json::to_string(payload) {
        Ok(json) => Some(Event::default().event(name).data(json)),
        Err(e) => {
            warn!(error = %e, "serialize SSE payload");
            None
        }
    }
}

/// SSE endpoint handler.
///
/// Runtime events arrive as `runtime` messages and terminal output as `terminal` messages;
/// both carry JSON with a `type` tag.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut runtime_rx = state.host.bus().subscribe();
    let mut terminal_rx = state.host.terminals().subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            let next = tokio::select! {
                received = runtime_rx.recv() => match received {
                    Ok(runtime_event) => event("runtime", &runtime_event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "SSE client lagged, some runtime events dropped");
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                received = terminal_rx.recv() => match received {
                    Ok(terminal_event) => event("terminal", &terminal_event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "SSE client lagged, some terminal output dropped");
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if let Some(sse) = next {
                yield Ok(sse);
            }
        }
        debug!("SSE stream closed");
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
