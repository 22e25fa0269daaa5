//! Asynchronous event bus shared by every orchestrator component.
//!
//! Publishers never block: sends with no subscribers are dropped, and subscribers that fall
//! behind lose the oldest events (they see `RecvError::Lagged`).

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::core::types::{AppState, ErrorReport, FixStatus, OutputRecord};

const DEFAULT_CAPACITY: usize = 1024;

/// Everything observers can learn about apps without polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    StateChanged {
        app_id: String,
        state: AppState,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    Output(OutputRecord),
    ProxyReady {
        app_id: String,
        proxy_url: String,
        original_url: String,
    },
    ReportUpdated {
        app_id: String,
        report: ErrorReport,
    },
    FixProgress {
        app_id: String,
        attempt: u32,
        status: FixProgressStatus,
    },
}

impl RuntimeEvent {
    pub fn app_id(&self) -> &str {
        match self {
            RuntimeEvent::StateChanged { app_id, .. }
            | RuntimeEvent::ProxyReady { app_id, .. }
            | RuntimeEvent::ReportUpdated { app_id, .. }
            | RuntimeEvent::FixProgress { app_id, .. } => app_id,
            RuntimeEvent::Output(record) => &record.app_id,
        }
    }
}

/// Where a fix loop is, as reported on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum FixProgressStatus {
    Prompting,
    Applying { edits: usize },
    Verifying,
    AttemptFailed { error: String },
    Finished { status: FixStatus },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: Arc<broadcast::Sender<RuntimeEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx: Arc::new(tx) }
    }

    pub fn publish(&self, event: RuntimeEvent) {
        if self.tx.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(RuntimeEvent::Output(OutputRecord::stdout("a", "hi")));
    }

    #[test]
    fn subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        for n in 0..3 {
            bus.publish(RuntimeEvent::Output(OutputRecord::stdout("a", n.to_string())));
        }
        for n in 0..3 {
            match rx.try_recv().expect("event") {
                RuntimeEvent::Output(record) => assert_eq!(record.message, n.to_string()),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let event = RuntimeEvent::StateChanged {
            app_id: "a".to_string(),
            state: AppState::Running,
            pid: Some(42),
            exit_code: None,
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["state"], "running");
        assert_eq!(json["pid"], 42);
        assert!(json.get("exit_code").is_none());

        let progress = RuntimeEvent::FixProgress {
            app_id: "a".to_string(),
            attempt: 1,
            status: FixProgressStatus::Applying { edits: 2 },
        };
        let json = serde_json::to_value(&progress).expect("json");
        assert_eq!(json["status"]["phase"], "applying");
        assert_eq!(json["status"]["edits"], 2);
    }
}
