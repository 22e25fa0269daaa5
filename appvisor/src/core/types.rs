//! Shared deterministic types for the orchestrator.
//!
//! These types are the stable contract between the supervisor, the classifier, the
//! auto-fix loop and whatever renders them. They carry no I/O handles and serialize
//! to JSON for the host service.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of an app the orchestrator can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSpec {
    pub id: String,
    pub name: String,
    /// Project root; the dev server runs here.
    pub root: PathBuf,
}

impl AppSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            root: root.into(),
        }
    }
}

/// Lifecycle state of an app's dev-server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Idle,
    Installing,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl AppState {
    pub fn as_str(self) -> &'static str {
        match self {
            AppState::Idle => "idle",
            AppState::Installing => "installing",
            AppState::Starting => "starting",
            AppState::Running => "running",
            AppState::Stopping => "stopping",
            AppState::Stopped => "stopped",
            AppState::Crashed => "crashed",
        }
    }

    /// States from which a fresh process may be spawned.
    pub fn can_start(self) -> bool {
        matches!(self, AppState::Idle | AppState::Stopped | AppState::Crashed)
    }

    /// States with a live child process attached.
    pub fn has_process(self) -> bool {
        matches!(
            self,
            AppState::Starting | AppState::Running | AppState::Stopping
        )
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one app's process as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProcessHandle {
    pub app_id: String,
    pub pid: Option<u32>,
    pub cwd: PathBuf,
    pub state: AppState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    /// Address the dev server itself announced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl AppProcessHandle {
    pub fn idle(app_id: &str, cwd: PathBuf) -> Self {
        Self {
            app_id: app_id.to_string(),
            pid: None,
            cwd,
            state: AppState::Idle,
            proxy_url: None,
            original_url: None,
            exit_code: None,
        }
    }

    /// Address the preview should load: the proxy when available, else the raw server.
    pub fn preview_url(&self) -> Option<&str> {
        self.proxy_url.as_deref().or(self.original_url.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub app_id: String,
    /// Per-app emission order, assigned at ingest.
    pub seq: u64,
    pub stream: OutputStream,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputRecord {
    pub fn new(app_id: &str, stream: OutputStream, message: impl Into<String>) -> Self {
        Self {
            app_id: app_id.to_string(),
            seq: 0,
            stream,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stdout(app_id: &str, message: impl Into<String>) -> Self {
        Self::new(app_id, OutputStream::Stdout, message)
    }

    pub fn stderr(app_id: &str, message: impl Into<String>) -> Self {
        Self::new(app_id, OutputStream::Stderr, message)
    }
}

/// Exception reported by the rendered preview surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeErrorEvent {
    #[serde(default)]
    pub app_id: String,
    /// e.g. `error`, `unhandledrejection`, `console.error`.
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// A build failure recognized in stderr.
///
/// Location fields are `None` for fatal-keyword matches (e.g. "cannot find module"
/// with no file position).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildError {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
    /// Tool error code (`TS2307`) or the fatal keyword that matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub has_errors: bool,
    pub build_errors: Vec<BuildError>,
    pub runtime_errors: Vec<RuntimeErrorEvent>,
    pub generated_at: DateTime<Utc>,
}

impl ErrorReport {
    pub fn empty() -> Self {
        Self {
            has_errors: false,
            build_errors: Vec::new(),
            runtime_errors: Vec::new(),
            generated_at: Utc::now(),
        }
    }

    pub fn error_count(&self) -> usize {
        self.build_errors.len() + self.runtime_errors.len()
    }

    /// Same classified content, ignoring when it was generated.
    pub fn same_errors(&self, other: &ErrorReport) -> bool {
        self.build_errors == other.build_errors && self.runtime_errors == other.runtime_errors
    }
}

/// A single file-edit directive returned by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditDirective {
    Write { path: String, content: String },
    Delete { path: String },
    AddDependency { packages: Vec<String> },
}

impl EditDirective {
    pub fn describe(&self) -> String {
        match self {
            EditDirective::Write { path, content } => {
                format!("write {path} ({} bytes)", content.len())
            }
            EditDirective::Delete { path } => format!("delete {path}"),
            EditDirective::AddDependency { packages } => {
                format!("add dependency {}", packages.join(" "))
            }
        }
    }
}

/// One round of prompt → agent → edits → fresh report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixAttempt {
    pub attempt_number: u32,
    pub prompt: String,
    pub response: Option<String>,
    pub applied_edits: Vec<EditDirective>,
    pub resulting_error_report: Option<ErrorReport>,
    /// Why the attempt aborted, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixStatus {
    /// A post-attempt report came back empty.
    Fixed,
    /// Attempts ran out with errors remaining.
    Exhausted,
    /// Cancellation was requested between attempts or during an agent call.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixOutcome {
    pub app_id: String,
    pub status: FixStatus,
    pub attempts: Vec<FixAttempt>,
    /// Errors left for manual handling (`None` once fixed).
    pub remaining: Option<ErrorReport>,
}

impl FixOutcome {
    pub fn last_attempt_number(&self) -> u32 {
        self.attempts.last().map_or(0, |a| a.attempt_number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSession {
    pub session_id: String,
    pub app_id: Option<String>,
    pub pid: Option<u32>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}
