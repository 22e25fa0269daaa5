//! Per-app output buffers and debounced error-report recomputation.
//!
//! Every output line passes through [`ErrorDetector::ingest`], which stamps it with a per-app
//! sequence number, appends it to a bounded ring buffer and republishes it on the bus. A
//! recomputation is scheduled at most once per debounce window; bursts of output collapse
//! into one `ReportUpdated` event reflecting the newest records at that moment.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace};

use crate::core::classifier::Classifier;
use crate::core::types::{ErrorReport, OutputRecord, RuntimeErrorEvent};
use crate::events::{EventBus, RuntimeEvent};
use crate::io::config::AppvisorConfig;

#[derive(Debug, Clone, Copy)]
pub struct DetectorOptions {
    pub output_capacity: usize,
    pub runtime_capacity: usize,
    pub debounce: Duration,
}

impl DetectorOptions {
    pub fn from_config(config: &AppvisorConfig) -> Self {
        Self {
            output_capacity: config.dev.output_buffer_lines,
            runtime_capacity: config.dev.runtime_error_buffer,
            debounce: config.debounce(),
        }
    }
}

#[derive(Debug, Default)]
struct AppBuffers {
    outputs: VecDeque<OutputRecord>,
    /// Runtime errors share the output sequence so fresh reports can skip stale ones.
    runtime_errors: VecDeque<(u64, RuntimeErrorEvent)>,
    next_seq: u64,
    /// Records before this sequence no longer count toward reports.
    epoch_seq: u64,
    recompute_pending: bool,
    latest: Option<ErrorReport>,
}

#[derive(Debug, Clone)]
pub struct ErrorDetector {
    apps: Arc<Mutex<HashMap<String, AppBuffers>>>,
    classifier: Arc<Classifier>,
    bus: EventBus,
    options: DetectorOptions,
}

impl ErrorDetector {
    pub fn new(classifier: Classifier, bus: EventBus, options: DetectorOptions) -> Self {
        Self {
            apps: Arc::new(Mutex::new(HashMap::new())),
            classifier: Arc::new(classifier),
            bus,
            options,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AppBuffers>> {
        self.apps.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a record, assigning its sequence number, and schedule a recomputation.
    pub fn ingest(&self, mut record: OutputRecord) -> OutputRecord {
        {
            let mut apps = self.lock();
            let buffers = apps.entry(record.app_id.clone()).or_default();
            record.seq = buffers.next_seq;
            buffers.next_seq += 1;
            if buffers.outputs.len() >= self.options.output_capacity {
                buffers.outputs.pop_front();
            }
            buffers.outputs.push_back(record.clone());
        }
        trace!(app_id = %record.app_id, seq = record.seq, "ingested output");
        self.bus.publish(RuntimeEvent::Output(record.clone()));
        self.schedule(&record.app_id);
        record
    }

    /// Store an exception reported by the preview surface.
    pub fn submit_runtime_error(&self, app_id: &str, mut event: RuntimeErrorEvent) {
        event.app_id = app_id.to_string();
        {
            let mut apps = self.lock();
            let buffers = apps.entry(app_id.to_string()).or_default();
            let seq = buffers.next_seq;
            buffers.next_seq += 1;
            if buffers.runtime_errors.len() >= self.options.runtime_capacity {
                buffers.runtime_errors.pop_front();
            }
            buffers.runtime_errors.push_back((seq, event));
        }
        debug!(app_id, "runtime error submitted");
        self.schedule(app_id);
    }

    /// Sequence number the next ingested record for `app_id` will get.
    pub fn next_seq(&self, app_id: &str) -> u64 {
        self.lock().get(app_id).map_or(0, |b| b.next_seq)
    }

    /// Buffered output for `app_id`, in emission order.
    pub fn logs(&self, app_id: &str) -> Vec<OutputRecord> {
        self.lock()
            .get(app_id)
            .map(|b| b.outputs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Last `n` buffered output lines.
    pub fn tail(&self, app_id: &str, n: usize) -> Vec<String> {
        self.lock()
            .get(app_id)
            .map(|b| {
                let skip = b.outputs.len().saturating_sub(n);
                b.outputs.iter().skip(skip).map(|r| r.message.clone()).collect()
            })
            .unwrap_or_default()
    }

    /// Report over the current epoch, computed now.
    pub fn report(&self, app_id: &str) -> ErrorReport {
        let apps = self.lock();
        match apps.get(app_id) {
            Some(buffers) => self.compute(buffers, buffers.epoch_seq),
            None => ErrorReport::empty(),
        }
    }

    /// Report over output and runtime errors recorded at or after `since`.
    pub fn report_since(&self, app_id: &str, since: u64) -> ErrorReport {
        let apps = self.lock();
        match apps.get(app_id) {
            Some(buffers) => self.compute(buffers, since.max(buffers.epoch_seq)),
            None => ErrorReport::empty(),
        }
    }

    /// The most recent debounced report, or a fresh one if none has been computed yet.
    pub fn latest_report(&self, app_id: &str) -> ErrorReport {
        let cached = self.lock().get(app_id).and_then(|b| b.latest.clone());
        cached.unwrap_or_else(|| self.report(app_id))
    }

    /// Drop runtime errors and start a new epoch so earlier build errors stop counting.
    pub fn clear_errors(&self, app_id: &str) {
        {
            let mut apps = self.lock();
            let buffers = apps.entry(app_id.to_string()).or_default();
            buffers.runtime_errors.clear();
            buffers.epoch_seq = buffers.next_seq;
        }
        debug!(app_id, "errors cleared");
        self.recompute(app_id);
    }

    /// Remove every buffer for `app_id`.
    pub fn forget(&self, app_id: &str) {
        self.lock().remove(app_id);
    }

    fn schedule(&self, app_id: &str) {
        {
            let mut apps = self.lock();
            let Some(buffers) = apps.get_mut(app_id) else {
                return;
            };
            if buffers.recompute_pending {
                return;
            }
            buffers.recompute_pending = true;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.recompute(app_id);
            return;
        };
        let detector = self.clone();
        let app_id = app_id.to_string();
        let debounce = self.options.debounce;
        handle.spawn(async move {
            tokio::time::sleep(debounce).await;
            detector.recompute(&app_id);
        });
    }

    /// Recompute now, cache the result and publish it when it changed.
    pub fn recompute(&self, app_id: &str) -> ErrorReport {
        let (report, changed) = {
            let mut apps = self.lock();
            let Some(buffers) = apps.get_mut(app_id) else {
                return ErrorReport::empty();
            };
            buffers.recompute_pending = false;
            let report = self.compute(buffers, buffers.epoch_seq);
            let changed = buffers
                .latest
                .as_ref()
                .is_none_or(|prev| !prev.same_errors(&report));
            buffers.latest = Some(report.clone());
            (report, changed)
        };
        if changed {
            debug!(
                app_id,
                errors = report.error_count(),
                "error report updated"
            );
            self.bus.publish(RuntimeEvent::ReportUpdated {
                app_id: app_id.to_string(),
                report: report.clone(),
            });
        }
        report
    }

    fn compute(&self, buffers: &AppBuffers, since: u64) -> ErrorReport {
        self.classifier.create_error_report(
            buffers.outputs.iter().filter(|r| r.seq >= since),
            buffers
                .runtime_errors
                .iter()
                .filter(|(seq, _)| *seq >= since)
                .map(|(_, event)| event),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(debounce_ms: u64) -> (ErrorDetector, EventBus) {
        let bus = EventBus::new(256);
        let detector = ErrorDetector::new(
            Classifier::default(),
            bus.clone(),
            DetectorOptions {
                output_capacity: 3,
                runtime_capacity: 2,
                debounce: Duration::from_millis(debounce_ms),
            },
        );
        (detector, bus)
    }

    fn runtime(message: &str) -> RuntimeErrorEvent {
        RuntimeErrorEvent {
            app_id: String::new(),
            kind: "error".to_string(),
            message: message.to_string(),
            stack: None,
            file: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn buffers_are_bounded_and_sequenced() {
        let (detector, _bus) = detector(10);
        for n in 0..5 {
            detector.ingest(OutputRecord::stdout("a", format!("line {n}")));
        }
        let logs = detector.logs("a");
        let seqs: Vec<u64> = logs.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(detector.next_seq("a"), 5);
        assert_eq!(detector.tail("a", 2), vec!["line 3", "line 4"]);
    }

    #[test]
    fn runtime_buffer_is_bounded() {
        let (detector, _bus) = detector(10);
        for msg in ["one", "two", "three"] {
            detector.submit_runtime_error("a", runtime(msg));
        }
        let report = detector.report("a");
        let messages: Vec<&str> = report
            .runtime_errors
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(messages, vec!["two", "three"]);
        assert_eq!(report.runtime_errors[0].app_id, "a");
    }

    #[test]
    fn clear_errors_starts_a_new_epoch() {
        let (detector, _bus) = detector(10);
        detector.ingest(OutputRecord::stderr("a", "src/App.tsx:1:1: Unexpected token"));
        detector.submit_runtime_error("a", runtime("boom"));
        assert_eq!(detector.report("a").error_count(), 2);

        detector.clear_errors("a");
        assert!(!detector.report("a").has_errors);
        assert_eq!(detector.logs("a").len(), 1);
    }

    #[test]
    fn report_since_ignores_older_records() {
        let (detector, _bus) = detector(10);
        detector.ingest(OutputRecord::stderr("a", "src/a.ts:1:1: old failure"));

        detector.submit_runtime_error("a", runtime("stale"));
        let marker = detector.next_seq("a");
        detector.ingest(OutputRecord::stderr("a", "src/b.ts:2:2: new failure"));
        detector.submit_runtime_error("a", runtime("fresh"));

        let report = detector.report_since("a", marker);
        assert_eq!(report.build_errors.len(), 1);
        assert_eq!(report.build_errors[0].file.as_deref(), Some("src/b.ts"));
        assert_eq!(report.runtime_errors.len(), 1);
        assert_eq!(report.runtime_errors[0].message, "fresh");
    }

    #[tokio::test]
    async fn bursts_collapse_into_one_report_event() {
        let (detector, bus) = detector(50);
        let mut rx = bus.subscribe();
        for _ in 0..10 {
            detector.ingest(OutputRecord::stderr(
                "a",
                "src/App.tsx:10:5: Cannot find module 'uuid'",
            ));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut reports = Vec::new();
        let mut outputs = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                RuntimeEvent::ReportUpdated { report, .. } => reports.push(report),
                RuntimeEvent::Output(_) => outputs += 1,
                _ => {}
            }
        }
        assert_eq!(outputs, 10);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].build_errors.len(), 1);
        assert!(detector.latest_report("a").has_errors);
    }

    #[test]
    fn unknown_app_has_an_empty_report() {
        let (detector, _bus) = detector(10);
        assert!(!detector.report("missing").has_errors);
        assert!(detector.logs("missing").is_empty());
    }
}
