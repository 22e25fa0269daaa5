//! The owning root of a running orchestrator.
//!
//! A [`Host`] wires one event bus, detector, supervisor, fixer and terminal manager
//! together and is the fix target and terminal control handler for all of them.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{AppSpec, ErrorReport, FixOutcome, OutputRecord, RuntimeErrorEvent, TerminalSession};
use crate::detector::{DetectorOptions, ErrorDetector};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::EventBus;
use crate::fix::{AutoFixer, FixOptions, FixTarget};
use crate::io::agent::{Agent, CommandAgent};
use crate::io::config::AppvisorConfig;
use crate::io::deps;
use crate::supervisor::{ENV_APP_ID, ENV_APP_NAME, ENV_APP_ROOT, Supervisor};
use crate::terminal::{ControlHandler, SessionRequest, TerminalManager};

pub struct Host {
    config: Arc<AppvisorConfig>,
    bus: EventBus,
    detector: ErrorDetector,
    supervisor: Supervisor,
    fixer: AutoFixer,
    terminals: TerminalManager,
    /// Replaces the configured agent CLI when set.
    agent: Option<Arc<dyn Agent>>,
    active_app: Mutex<Option<String>>,
}

impl Host {
    pub fn new(config: AppvisorConfig) -> Result<Arc<Self>> {
        Self::build(config, None)
    }

    /// A host whose fix loops use `agent` instead of spawning the configured CLI.
    pub fn with_agent(config: AppvisorConfig, agent: Arc<dyn Agent>) -> Result<Arc<Self>> {
        Self::build(config, Some(agent))
    }

    fn build(config: AppvisorConfig, agent: Option<Arc<dyn Agent>>) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let bus = EventBus::default();
        let detector = ErrorDetector::new(
            config.classifier()?,
            bus.clone(),
            DetectorOptions::from_config(&config),
        );
        let supervisor = Supervisor::new(config.clone(), detector.clone(), bus.clone())?;
        let fixer = AutoFixer::new(FixOptions::from_config(&config), bus.clone());
        Ok(Arc::new_cyclic(|me: &Weak<Host>| {
            let handler: Weak<dyn ControlHandler> = me.clone();
            Host {
                terminals: TerminalManager::with_handler(config.terminal.clone(), handler),
                config,
                bus,
                detector,
                supervisor,
                fixer,
                agent,
                active_app: Mutex::new(None),
            }
        }))
    }

    pub fn config(&self) -> &AppvisorConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn detector(&self) -> &ErrorDetector {
        &self.detector
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn fixer(&self) -> &AutoFixer {
        &self.fixer
    }

    pub fn terminals(&self) -> &TerminalManager {
        &self.terminals
    }

    fn active(&self) -> MutexGuard<'_, Option<String>> {
        self.active_app.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn active_app(&self) -> Option<String> {
        self.active().clone()
    }

    pub async fn run_app(&self, spec: &AppSpec) -> OrchestratorResult<String> {
        self.supervisor.run(spec).await
    }

    /// Stop the dev server and close the app's terminal sessions.
    pub async fn stop_app(&self, app_id: &str) -> OrchestratorResult<()> {
        self.supervisor.stop(app_id).await?;
        self.terminals.kill_sessions_for_app(app_id);
        Ok(())
    }

    /// Make `spec` the only running app: the previous one is stopped and its sessions closed.
    #[instrument(skip_all, fields(app_id = %spec.id))]
    pub async fn switch_active_app(&self, spec: &AppSpec) -> OrchestratorResult<String> {
        let previous = self.active().replace(spec.id.clone());
        if let Some(previous) = previous.filter(|p| *p != spec.id) {
            info!(previous = %previous, "switching active app");
            match self.supervisor.stop(&previous).await {
                Ok(_) | Err(OrchestratorError::AppNotFound(_)) => {}
                Err(err) => warn!(previous = %previous, err = %err, "stop previous app"),
            }
            self.terminals.kill_sessions_for_app(&previous);
        }
        self.supervisor.run(spec).await
    }

    /// Stop the app, close its sessions and drop everything recorded about it.
    #[instrument(skip_all, fields(app_id = %app_id))]
    pub async fn delete_app(&self, app_id: &str) -> OrchestratorResult<()> {
        self.fixer.cancel(app_id);
        match self.supervisor.stop(app_id).await {
            Ok(_) | Err(OrchestratorError::AppNotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.terminals.kill_sessions_for_app(app_id);
        self.supervisor.forget(app_id);
        self.detector.forget(app_id);
        let mut active = self.active();
        if active.as_deref() == Some(app_id) {
            *active = None;
        }
        info!("app deleted");
        Ok(())
    }

    pub fn submit_runtime_error(&self, app_id: &str, event: RuntimeErrorEvent) {
        self.detector.submit_runtime_error(app_id, event);
    }

    pub fn report(&self, app_id: &str) -> ErrorReport {
        self.detector.report(app_id)
    }

    /// Run the auto-fix loop against the app's current report, skipping the debounce.
    pub async fn fix(&self, app_id: &str) -> OrchestratorResult<FixOutcome> {
        let root = self.project_root(app_id)?;
        let report = self.detector.report(app_id);
        let agent: Arc<dyn Agent> = match &self.agent {
            Some(agent) => agent.clone(),
            None => Arc::new(CommandAgent::new(&self.config.agent).in_dir(root)),
        };
        self.fixer
            .auto_fix(app_id, report, agent.as_ref(), self)
            .await
    }

    pub fn cancel_fix(&self, app_id: &str) -> bool {
        self.fixer.cancel(app_id)
    }

    /// Open a shell. App sessions default to the app root and inherit its identity variables.
    pub fn create_session(&self, mut request: SessionRequest) -> OrchestratorResult<TerminalSession> {
        if let Some(app_id) = &request.app_id {
            let spec = self
                .supervisor
                .spec(app_id)
                .ok_or_else(|| OrchestratorError::AppNotFound(app_id.clone()))?;
            if request.cwd.as_os_str().is_empty() {
                request.cwd.clone_from(&spec.root);
            }
            request.env.insert(ENV_APP_ID.to_string(), spec.id.clone());
            request.env.insert(ENV_APP_NAME.to_string(), spec.name.clone());
            request
                .env
                .insert(ENV_APP_ROOT.to_string(), spec.root.display().to_string());
        }
        if request.cwd.as_os_str().is_empty() {
            request.cwd = std::env::current_dir().map_err(anyhow::Error::from)?;
        }
        self.terminals.create_session(request)
    }

    /// Stop every app and close every session.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.supervisor.stop_all().await;
        self.terminals.kill_all();
    }
}

#[async_trait]
impl FixTarget for Host {
    fn project_root(&self, app_id: &str) -> OrchestratorResult<PathBuf> {
        self.supervisor
            .spec(app_id)
            .map(|spec| spec.root)
            .ok_or_else(|| OrchestratorError::AppNotFound(app_id.to_string()))
    }

    async fn install_dependencies(
        &self,
        app_id: &str,
        packages: &[String],
    ) -> OrchestratorResult<()> {
        let root = self.project_root(app_id)?;
        let detector = self.detector.clone();
        let owner = app_id.to_string();
        deps::install(&root, &self.config.dev, packages, move |stream, line| {
            detector.ingest(OutputRecord::new(&owner, stream, line));
        })
        .await
    }

    fn is_running(&self, app_id: &str) -> bool {
        self.supervisor.is_running(app_id)
    }

    async fn restart(&self, app_id: &str) -> OrchestratorResult<()> {
        self.supervisor.restart(app_id, false).await.map(|_| ())
    }

    fn report_marker(&self, app_id: &str) -> u64 {
        self.detector.next_seq(app_id)
    }

    async fn fresh_report(&self, app_id: &str, marker: u64) -> ErrorReport {
        tokio::time::sleep(Duration::from_millis(self.config.fix.settle_ms)).await;
        let report = self.detector.report_since(app_id, marker);
        debug!(app_id, marker, errors = report.error_count(), "fresh report");
        report
    }
}

#[async_trait]
impl ControlHandler for Host {
    async fn fix(&self, app_id: &str) -> OrchestratorResult<FixOutcome> {
        Host::fix(self, app_id).await
    }

    fn clear_errors(&self, app_id: &str) {
        self.detector.clear_errors(app_id);
    }
}
