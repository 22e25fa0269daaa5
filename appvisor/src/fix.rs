//! Auto-Fix Orchestrator: error report → prompt → agent → edits → fresh report, bounded.
//!
//! At most one loop runs per app. Each attempt is wrapped in a wall-clock ceiling and
//! consumes one unit of the attempt budget whether it succeeds, fails or times out.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::directives::{parse_directives, resolve_in_root};
use crate::core::types::{
    BuildError, EditDirective, ErrorReport, FixAttempt, FixOutcome, FixStatus, RuntimeErrorEvent,
};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, FixProgressStatus, RuntimeEvent};
use crate::io::agent::Agent;
use crate::io::config::AppvisorConfig;
use crate::io::edits::apply_file_edit;

const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");

/// Lines of source shown on each side of a located error.
const SNIPPET_RADIUS: u32 = 3;
const MAX_SNIPPETS: usize = 8;
const MAX_STACK_LINES: usize = 12;

static PROMPTS: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("fix", FIX_TEMPLATE)
        .expect("fix template should be valid");
    env
});

/// What the fix loop needs from the rest of the system.
#[async_trait]
pub trait FixTarget: Send + Sync {
    fn project_root(&self, app_id: &str) -> OrchestratorResult<PathBuf>;

    async fn install_dependencies(&self, app_id: &str, packages: &[String])
    -> OrchestratorResult<()>;

    fn is_running(&self, app_id: &str) -> bool;

    async fn restart(&self, app_id: &str) -> OrchestratorResult<()>;

    /// Position in the app's output stream; records after it are "fresh".
    fn report_marker(&self, app_id: &str) -> u64;

    /// Wait for output to settle, then report on what was recorded since `marker`.
    async fn fresh_report(&self, app_id: &str, marker: u64) -> ErrorReport;
}

/// Source lines around a located build error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSnippet {
    pub file: String,
    pub first_line: u32,
    pub last_line: u32,
    pub text: String,
}

#[derive(Serialize)]
struct BuildErrorView<'a> {
    location: String,
    message: &'a str,
    code: Option<&'a str>,
}

impl<'a> From<&'a BuildError> for BuildErrorView<'a> {
    fn from(err: &'a BuildError) -> Self {
        let location = match (&err.file, err.line, err.column) {
            (Some(file), Some(line), Some(column)) => format!("{file}:{line}:{column}"),
            (Some(file), Some(line), None) => format!("{file}:{line}"),
            (Some(file), None, _) => file.clone(),
            (None, _, _) => "(no location)".to_string(),
        };
        Self {
            location,
            message: &err.message,
            code: err.code.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct RuntimeErrorView<'a> {
    kind: &'a str,
    message: &'a str,
    file: Option<&'a str>,
    stack: Option<String>,
}

impl<'a> From<&'a RuntimeErrorEvent> for RuntimeErrorView<'a> {
    fn from(err: &'a RuntimeErrorEvent) -> Self {
        Self {
            kind: &err.kind,
            message: &err.message,
            file: err.file.as_deref(),
            stack: err.stack.as_deref().map(|stack| {
                stack
                    .lines()
                    .take(MAX_STACK_LINES)
                    .collect::<Vec<_>>()
                    .join("\n")
            }),
        }
    }
}

/// Render every error in `report` as agent input. Same report, same prompt.
pub fn generate_fix_prompt(report: &ErrorReport) -> Result<String> {
    render_fix_prompt(report, &[])
}

/// [`generate_fix_prompt`] plus source context for located errors.
pub fn render_fix_prompt(report: &ErrorReport, snippets: &[SourceSnippet]) -> Result<String> {
    let build_errors: Vec<BuildErrorView<'_>> =
        report.build_errors.iter().map(BuildErrorView::from).collect();
    let runtime_errors: Vec<RuntimeErrorView<'_>> = report
        .runtime_errors
        .iter()
        .map(RuntimeErrorView::from)
        .collect();
    let template = PROMPTS.get_template("fix")?;
    let rendered = template
        .render(context! {
            build_errors => build_errors,
            runtime_errors => runtime_errors,
            snippets => snippets,
        })
        .context("render fix prompt")?;
    Ok(rendered)
}

/// Read a few lines around each located build error. Unreadable files are skipped.
pub fn collect_snippets(root: &Path, report: &ErrorReport) -> Vec<SourceSnippet> {
    let mut snippets = Vec::new();
    for err in &report.build_errors {
        if snippets.len() >= MAX_SNIPPETS {
            break;
        }
        let (Some(file), Some(line)) = (&err.file, err.line) else {
            continue;
        };
        let Ok(path) = resolve_in_root(root, file) else {
            continue;
        };
        let Ok(source) = fs::read_to_string(&path) else {
            debug!(file, "no source context");
            continue;
        };
        let first_line = line.saturating_sub(SNIPPET_RADIUS).max(1);
        let last_line = line.saturating_add(SNIPPET_RADIUS);
        let text: Vec<String> = source
            .lines()
            .enumerate()
            .map(|(idx, text)| (idx as u32 + 1, text))
            .filter(|(n, _)| (first_line..=last_line).contains(n))
            .map(|(n, text)| format!("{n:>5} | {text}"))
            .collect();
        if text.is_empty() {
            continue;
        }
        let last_line = first_line + text.len() as u32 - 1;
        snippets.push(SourceSnippet {
            file: file.clone(),
            first_line,
            last_line,
            text: text.join("\n"),
        });
    }
    snippets
}

#[derive(Debug, Clone, Copy)]
pub struct FixOptions {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

impl FixOptions {
    pub fn from_config(config: &AppvisorConfig) -> Self {
        Self {
            max_attempts: config.fix.max_attempts,
            attempt_timeout: Duration::from_secs(config.fix.attempt_timeout_secs),
        }
    }
}

/// Removes the app from the in-flight set when the loop ends, however it ends.
struct InFlight {
    fixer: AutoFixer,
    app_id: String,
    cancel: Arc<AtomicBool>,
}

impl InFlight {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.fixer.lock().remove(&self.app_id);
    }
}

enum AttemptEnd {
    Verified(ErrorReport),
    /// Nothing was edited and the app was not restarted.
    Unchanged,
    Cancelled,
}

#[derive(Clone)]
pub struct AutoFixer {
    in_flight: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    bus: EventBus,
    options: FixOptions,
}

impl AutoFixer {
    pub fn new(options: FixOptions, bus: EventBus) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            bus,
            options,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self, app_id: &str) -> bool {
        self.lock().contains_key(app_id)
    }

    /// Ask the app's loop to stop. Takes effect between attempts or when the agent returns.
    pub fn cancel(&self, app_id: &str) -> bool {
        match self.lock().get(app_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(app_id, "auto-fix cancellation requested");
                true
            }
            None => false,
        }
    }

    fn begin(&self, app_id: &str) -> OrchestratorResult<InFlight> {
        let mut in_flight = self.lock();
        if in_flight.contains_key(app_id) {
            return Err(OrchestratorError::FixInProgress(app_id.to_string()));
        }
        let cancel = Arc::new(AtomicBool::new(false));
        in_flight.insert(app_id.to_string(), cancel.clone());
        Ok(InFlight {
            fixer: self.clone(),
            app_id: app_id.to_string(),
            cancel,
        })
    }

    /// Run the bounded repair loop starting from `report`.
    #[instrument(skip_all, fields(app_id = %app_id, errors = report.error_count()))]
    pub async fn auto_fix(
        &self,
        app_id: &str,
        report: ErrorReport,
        agent: &dyn Agent,
        target: &dyn FixTarget,
    ) -> OrchestratorResult<FixOutcome> {
        let guard = self.begin(app_id)?;
        let mut attempts = Vec::new();
        if !report.has_errors {
            debug!("nothing to fix");
            return Ok(self.finish(app_id, FixStatus::Fixed, attempts, None));
        }
        let root = target.project_root(app_id)?;
        let mut current = report;

        for attempt_number in 1..=self.options.max_attempts {
            if guard.cancelled() {
                return Ok(self.finish(app_id, FixStatus::Cancelled, attempts, Some(current)));
            }
            self.progress(app_id, attempt_number, FixProgressStatus::Prompting);
            let snippets = collect_snippets(&root, &current);
            let prompt = render_fix_prompt(&current, &snippets)?;
            let mut attempt = FixAttempt {
                attempt_number,
                prompt: prompt.clone(),
                response: None,
                applied_edits: Vec::new(),
                resulting_error_report: None,
                error: None,
            };
            let marker = target.report_marker(app_id);
            info!(attempt_number, "starting fix attempt");

            let ended = tokio::time::timeout(
                self.options.attempt_timeout,
                self.attempt(
                    app_id,
                    &root,
                    &prompt,
                    marker,
                    agent,
                    target,
                    &guard,
                    &mut attempt,
                ),
            )
            .await;

            match ended {
                Ok(Ok(AttemptEnd::Verified(fresh))) => {
                    let fixed = !fresh.has_errors;
                    info!(
                        attempt_number,
                        remaining = fresh.error_count(),
                        "fix attempt verified"
                    );
                    attempt.resulting_error_report = Some(fresh.clone());
                    attempts.push(attempt);
                    if fixed {
                        return Ok(self.finish(app_id, FixStatus::Fixed, attempts, None));
                    }
                    current = fresh;
                }
                Ok(Ok(AttemptEnd::Unchanged)) => {
                    // Without a reload the errors going in are still current.
                    warn!(attempt_number, "agent response changed nothing");
                    attempt.resulting_error_report = Some(current.clone());
                    self.fail_attempt(
                        app_id,
                        &mut attempt,
                        "agent response contained no edits".to_string(),
                    );
                    attempts.push(attempt);
                }
                Ok(Ok(AttemptEnd::Cancelled)) => {
                    attempts.push(attempt);
                    return Ok(self.finish(app_id, FixStatus::Cancelled, attempts, Some(current)));
                }
                Ok(Err(err)) => {
                    warn!(attempt_number, err = %err, "fix attempt failed");
                    self.fail_attempt(app_id, &mut attempt, err.to_string());
                    attempts.push(attempt);
                }
                Err(_) => {
                    let timeout = self.options.attempt_timeout;
                    warn!(attempt_number, ?timeout, "fix attempt timed out");
                    self.fail_attempt(
                        app_id,
                        &mut attempt,
                        format!("attempt timed out after {timeout:?}"),
                    );
                    attempts.push(attempt);
                }
            }
        }

        let status = if guard.cancelled() {
            FixStatus::Cancelled
        } else {
            FixStatus::Exhausted
        };
        Ok(self.finish(app_id, status, attempts, Some(current)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        app_id: &str,
        root: &Path,
        prompt: &str,
        marker: u64,
        agent: &dyn Agent,
        target: &dyn FixTarget,
        guard: &InFlight,
        attempt: &mut FixAttempt,
    ) -> OrchestratorResult<AttemptEnd> {
        let response = agent
            .complete(prompt)
            .await
            .map_err(|e| OrchestratorError::AgentInvocationFailed(format!("{e:#}")))?;
        attempt.response = Some(response.clone());
        if guard.cancelled() {
            debug!("discarding agent response after cancellation");
            return Ok(AttemptEnd::Cancelled);
        }

        let directives = parse_directives(&response);
        self.progress(
            app_id,
            attempt.attempt_number,
            FixProgressStatus::Applying {
                edits: directives.len(),
            },
        );
        let mut dependency_added = false;
        for directive in directives {
            match &directive {
                EditDirective::AddDependency { packages } => {
                    target.install_dependencies(app_id, packages).await?;
                    dependency_added = true;
                }
                EditDirective::Write { .. } | EditDirective::Delete { .. } => {
                    apply_file_edit(root, &directive)?;
                }
            }
            attempt.applied_edits.push(directive);
        }

        let running = target.is_running(app_id);
        if attempt.applied_edits.is_empty() && running {
            return Ok(AttemptEnd::Unchanged);
        }

        self.progress(app_id, attempt.attempt_number, FixProgressStatus::Verifying);
        if dependency_added || !running {
            // A failed restart shows up as errors in the fresh report.
            if let Err(err) = target.restart(app_id).await {
                warn!(err = %err, "restart after edits failed");
            }
        }
        Ok(AttemptEnd::Verified(
            target.fresh_report(app_id, marker).await,
        ))
    }

    fn fail_attempt(&self, app_id: &str, attempt: &mut FixAttempt, error: String) {
        self.progress(
            app_id,
            attempt.attempt_number,
            FixProgressStatus::AttemptFailed {
                error: error.clone(),
            },
        );
        attempt.error = Some(error);
    }

    fn finish(
        &self,
        app_id: &str,
        status: FixStatus,
        attempts: Vec<FixAttempt>,
        remaining: Option<ErrorReport>,
    ) -> FixOutcome {
        let outcome = FixOutcome {
            app_id: app_id.to_string(),
            status,
            attempts,
            remaining,
        };
        info!(
            app_id,
            ?status,
            attempts = outcome.attempts.len(),
            "auto-fix finished"
        );
        self.progress(
            app_id,
            outcome.last_attempt_number(),
            FixProgressStatus::Finished { status },
        );
        outcome
    }

    fn progress(&self, app_id: &str, attempt: u32, status: FixProgressStatus) {
        self.bus.publish(RuntimeEvent::FixProgress {
            app_id: app_id.to_string(),
            attempt,
            status,
        });
    }
}
