//! Process Supervisor: one dev-server child per app, readiness detection, proxying.
//!
//! The registry is an app-id keyed map behind a short-lived lock that is never held across
//! an await. Each spawned child gets three tasks:
//!
//! - two readers that forward raw stdout/stderr lines into one channel,
//! - a pump that ingests those lines in arrival order and watches for the ready sentinel,
//! - a waiter that owns the [`Child`], kills it on request and publishes its exit.
//!
//! Every run bumps the app's generation so a late exit from an old child can never
//! overwrite the state of a newer one.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::core::ready::ReadyDetector;
use crate::core::types::{AppProcessHandle, AppSpec, AppState, OutputRecord, OutputStream};
use crate::detector::ErrorDetector;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, RuntimeEvent};
use crate::io::config::AppvisorConfig;
use crate::io::deps;
use crate::io::proxy::{self, ProxyHandle, ProxyMessage, ProxyOptions};

/// Environment variables that tell a child which app it belongs to.
pub const ENV_APP_ID: &str = "APPVISOR_APP_ID";
pub const ENV_APP_NAME: &str = "APPVISOR_APP_NAME";
pub const ENV_APP_ROOT: &str = "APPVISOR_APP_ROOT";

/// How long output may keep draining after the child itself has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitInfo {
    code: Option<i32>,
}

type ExitReceiver = watch::Receiver<Option<ExitInfo>>;

struct RunningProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: ExitReceiver,
}

struct ManagedApp {
    spec: AppSpec,
    handle: AppProcessHandle,
    generation: u64,
    process: Option<RunningProcess>,
    proxy: Option<ProxyHandle>,
}

impl ManagedApp {
    fn new(spec: &AppSpec) -> Self {
        Self {
            spec: spec.clone(),
            handle: AppProcessHandle::idle(&spec.id, spec.root.clone()),
            generation: 0,
            process: None,
            proxy: None,
        }
    }
}

enum StartOutcome {
    Ready(String),
    Exited(Option<i32>),
}

struct Inner {
    apps: Mutex<HashMap<String, ManagedApp>>,
    config: Arc<AppvisorConfig>,
    ready: ReadyDetector,
    detector: ErrorDetector,
    bus: EventBus,
    next_proxy_port: AtomicU16,
}

/// Registry of supervised dev servers. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        config: Arc<AppvisorConfig>,
        detector: ErrorDetector,
        bus: EventBus,
    ) -> anyhow::Result<Self> {
        let ready = config.ready_detector()?;
        let first_port = config.proxy.port_range_start;
        Ok(Self {
            inner: Arc::new(Inner {
                apps: Mutex::new(HashMap::new()),
                config,
                ready,
                detector,
                bus,
                next_proxy_port: AtomicU16::new(first_port),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ManagedApp>> {
        self.inner.apps.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of an app's handle; unknown apps report `Idle`.
    pub fn status(&self, app_id: &str) -> AppProcessHandle {
        self.lock().get(app_id).map_or_else(
            || AppProcessHandle::idle(app_id, Default::default()),
            |app| app.handle.clone(),
        )
    }

    pub fn statuses(&self) -> Vec<AppProcessHandle> {
        let mut handles: Vec<_> = self.lock().values().map(|a| a.handle.clone()).collect();
        handles.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        handles
    }

    pub fn spec(&self, app_id: &str) -> Option<AppSpec> {
        self.lock().get(app_id).map(|a| a.spec.clone())
    }

    pub fn is_running(&self, app_id: &str) -> bool {
        self.status(app_id).state == AppState::Running
    }

    /// Buffered output for an app, in emission order.
    pub fn logs(&self, app_id: &str) -> Vec<OutputRecord> {
        self.inner.detector.logs(app_id)
    }

    /// Start the app's dev server and return the address the preview should load.
    ///
    /// Idempotent for a running app: the existing address is returned and nothing is spawned.
    pub async fn run(&self, spec: &AppSpec) -> OrchestratorResult<String> {
        self.start(spec, false).await
    }

    /// `run`, installing dependencies first when `reinstall` is set or the cache is missing.
    #[instrument(skip_all, fields(app_id = %spec.id, reinstall))]
    async fn start(&self, spec: &AppSpec, reinstall: bool) -> OrchestratorResult<String> {
        let dev = &self.inner.config.dev;
        let install = if reinstall {
            deps::can_install(&spec.root, dev)
        } else {
            deps::needs_install(&spec.root, dev)
        };
        let (generation, snapshot) = {
            let mut apps = self.lock();
            let app = apps
                .entry(spec.id.clone())
                .or_insert_with(|| ManagedApp::new(spec));
            if app.handle.state == AppState::Running
                && let Some(url) = app.handle.preview_url()
            {
                debug!(url, "already running");
                return Ok(url.to_string());
            }
            if !app.handle.state.can_start() {
                return Err(OrchestratorError::InvalidState {
                    app_id: spec.id.clone(),
                    state: app.handle.state,
                    operation: "run",
                });
            }
            app.spec = spec.clone();
            app.generation += 1;
            app.process = None;
            app.proxy = None;
            app.handle = AppProcessHandle::idle(&spec.id, spec.root.clone());
            app.handle.state = if install {
                AppState::Installing
            } else {
                AppState::Starting
            };
            (app.generation, app.handle.clone())
        };
        self.publish_state(&snapshot);

        if install {
            let detector = self.inner.detector.clone();
            let app_id = spec.id.clone();
            let installed = deps::install(&spec.root, dev, &[], move |stream, line| {
                detector.ingest(OutputRecord::new(&app_id, stream, line));
            })
            .await;
            if let Err(err) = installed {
                self.record(&spec.id, OutputStream::Stderr, format!("[appvisor] {err}"));
                self.finish(&spec.id, generation, AppState::Stopped, None);
                return Err(err);
            }
            let snapshot = self.advance(&spec.id, generation, AppState::Installing, AppState::Starting)?;
            self.publish_state(&snapshot);
        }

        let mut child = match self.spawn_child(spec) {
            Ok(child) => child,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(err = %message, "dev server failed to spawn");
                self.record(
                    &spec.id,
                    OutputStream::Stderr,
                    format!("[appvisor] failed to start dev server: {message}"),
                );
                self.finish(&spec.id, generation, AppState::Stopped, None);
                return Err(OrchestratorError::ProcessSpawnFailed(message));
            }
        };
        let pid = child.id();
        info!(?pid, "dev server spawned");

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_lines(stdout, OutputStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_lines(stderr, OutputStream::Stderr, line_tx.clone()));
        }
        drop(line_tx);

        let (ready_tx, mut ready_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, mut exit_rx) = watch::channel(None);
        let pump = tokio::spawn(pump_output(
            self.inner.detector.clone(),
            self.inner.ready.clone(),
            spec.id.clone(),
            line_rx,
            ready_tx,
        ));

        let snapshot = {
            let mut apps = self.lock();
            let app = apps
                .get_mut(&spec.id)
                .filter(|app| app.generation == generation);
            app.map(|app| {
                app.handle.pid = pid;
                app.process = Some(RunningProcess {
                    pid,
                    kill_tx: Some(kill_tx),
                    exit_rx: exit_rx.clone(),
                });
                app.handle.clone()
            })
        };
        // The waiter owns the child; if registration failed, its kill channel is already
        // closed and it kills the child straight away.
        tokio::spawn(self.clone().wait_for_exit(
            spec.id.clone(),
            generation,
            child,
            kill_rx,
            pump,
            exit_tx,
        ));
        let Some(snapshot) = snapshot else {
            return Err(self.superseded(&spec.id));
        };
        self.publish_state(&snapshot);

        let timeout = Duration::from_secs(dev.ready_timeout_secs);
        let outcome =
            tokio::time::timeout(timeout, await_start(&mut ready_rx, &mut exit_rx)).await;
        match outcome {
            Err(_) => {
                let tail = self.tail(&spec.id);
                warn!(timeout_secs = dev.ready_timeout_secs, "dev server never became ready");
                self.record(
                    &spec.id,
                    OutputStream::Stderr,
                    format!(
                        "[appvisor] dev server did not report readiness within {}s, stopping it",
                        dev.ready_timeout_secs
                    ),
                );
                if let Err(err) = self.stop(&spec.id).await {
                    warn!(err = %err, "stop after ready timeout failed");
                }
                Err(OrchestratorError::ReadyTimeout {
                    secs: dev.ready_timeout_secs,
                    tail,
                })
            }
            Ok(StartOutcome::Exited(code)) => Err(self.start_failure(&spec.id, generation, code)),
            Ok(StartOutcome::Ready(origin)) => self.promote(spec, generation, origin).await,
        }
    }

    /// Starting → Running once the dev server announced `origin`.
    async fn promote(
        &self,
        spec: &AppSpec,
        generation: u64,
        origin: String,
    ) -> OrchestratorResult<String> {
        info!(%origin, "dev server ready");
        let mut proxy = None;
        if self.inner.config.proxy.enabled {
            match proxy::start(&origin, &self.proxy_options()).await {
                Ok(handle) => {
                    self.advance_proxy_cursor(handle.port);
                    proxy = Some(handle);
                }
                Err(err) => {
                    warn!(err = %err, "proxy unavailable, falling back to the dev server address");
                    self.record(
                        &spec.id,
                        OutputStream::Stderr,
                        format!("[appvisor] preview proxy unavailable ({err}); serving {origin} directly"),
                    );
                }
            }
        }
        let messages = proxy.as_mut().and_then(ProxyHandle::take_messages);

        let promoted = {
            let mut apps = self.lock();
            match apps.get_mut(&spec.id) {
                Some(app)
                    if app.generation == generation && app.handle.state == AppState::Starting =>
                {
                    app.handle.state = AppState::Running;
                    app.handle.original_url = Some(origin.clone());
                    app.handle.proxy_url = proxy.as_ref().map(|p| p.proxy_url.clone());
                    app.proxy = proxy;
                    Some(app.handle.clone())
                }
                _ => None,
            }
        };
        let Some(snapshot) = promoted else {
            // Crashed or stopped while the proxy was starting. An unused proxy handle shuts
            // its worker down when dropped.
            let state = self.status(&spec.id);
            if state.state == AppState::Crashed {
                return Err(OrchestratorError::ProcessCrashed {
                    exit_code: state.exit_code,
                    tail: self.tail(&spec.id),
                });
            }
            return Err(self.superseded(&spec.id));
        };

        self.publish_state(&snapshot);
        if let Some(proxy_url) = &snapshot.proxy_url {
            self.inner.bus.publish(RuntimeEvent::ProxyReady {
                app_id: spec.id.clone(),
                proxy_url: proxy_url.clone(),
                original_url: origin.clone(),
            });
        }
        if let Some(messages) = messages {
            self.watch_proxy(&spec.id, generation, messages);
        }
        Ok(snapshot.preview_url().unwrap_or(&origin).to_string())
    }

    /// Gracefully stop the app's dev server, force-killing it after the grace period.
    #[instrument(skip_all, fields(app_id = %app_id))]
    pub async fn stop(&self, app_id: &str) -> OrchestratorResult<AppProcessHandle> {
        let (process, proxy, generation, snapshot) = {
            let mut apps = self.lock();
            let app = apps
                .get_mut(app_id)
                .ok_or_else(|| OrchestratorError::AppNotFound(app_id.to_string()))?;
            match app.handle.state {
                AppState::Starting | AppState::Running => {}
                AppState::Stopping => return Ok(app.handle.clone()),
                AppState::Installing => {
                    // The pending run notices the new generation once the install returns.
                    app.generation += 1;
                    app.handle.state = AppState::Stopped;
                    let snapshot = app.handle.clone();
                    drop(apps);
                    self.publish_state(&snapshot);
                    return Ok(snapshot);
                }
                AppState::Idle | AppState::Stopped | AppState::Crashed => {
                    app.proxy = None;
                    app.handle.proxy_url = None;
                    let was_crashed = app.handle.state == AppState::Crashed;
                    if was_crashed {
                        app.handle.state = AppState::Stopped;
                    }
                    let snapshot = app.handle.clone();
                    drop(apps);
                    if was_crashed {
                        self.publish_state(&snapshot);
                    }
                    return Ok(snapshot);
                }
            }
            app.handle.state = AppState::Stopping;
            (
                app.process.take(),
                app.proxy.take(),
                app.generation,
                app.handle.clone(),
            )
        };
        self.publish_state(&snapshot);
        drop(proxy);

        let exit_code = match process {
            Some(process) => self.terminate(process).await,
            None => None,
        };
        let snapshot = self
            .finish(app_id, generation, AppState::Stopped, exit_code)
            .unwrap_or_else(|| self.status(app_id));
        info!(?exit_code, "dev server stopped");
        Ok(snapshot)
    }

    /// Stop, optionally drop the dependency cache, reinstall, then run again.
    #[instrument(skip_all, fields(app_id = %app_id, remove_dependency_cache))]
    pub async fn restart(
        &self,
        app_id: &str,
        remove_dependency_cache: bool,
    ) -> OrchestratorResult<String> {
        let spec = self
            .spec(app_id)
            .ok_or_else(|| OrchestratorError::AppNotFound(app_id.to_string()))?;
        self.stop(app_id).await?;
        if remove_dependency_cache {
            let cache = spec.root.join(&self.inner.config.dev.dependency_dir);
            match tokio::fs::remove_dir_all(&cache).await {
                Ok(()) => info!(path = %cache.display(), "removed dependency cache"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(OrchestratorError::DependencyInstallFailed(format!(
                        "remove {}: {e}",
                        cache.display()
                    )));
                }
            }
        }
        self.start(&spec, true).await
    }

    /// Reinstall from the current manifest and start again.
    pub async fn rebuild(&self, app_id: &str) -> OrchestratorResult<String> {
        self.restart(app_id, true).await
    }

    /// Stop every app that has (or is about to have) a process.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, app)| {
                app.handle.state.has_process() || app.handle.state == AppState::Installing
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Err(err) = self.stop(&id).await {
                warn!(app_id = %id, err = %err, "stop failed during shutdown");
            }
        }
    }

    /// Drop an app from the registry. A still-running child is killed.
    pub fn forget(&self, app_id: &str) {
        if self.lock().remove(app_id).is_some() {
            debug!(app_id, "app forgotten");
        }
    }

    fn spawn_child(&self, spec: &AppSpec) -> anyhow::Result<Child> {
        let argv = &self.inner.config.dev.command;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty dev command"))?;
        let mut cmd = std::process::Command::new(program);
        cmd.args(args)
            .current_dir(&spec.root)
            .env(ENV_APP_ID, &spec.id)
            .env(ENV_APP_NAME, &spec.name)
            .env(ENV_APP_ROOT, &spec.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so stop() reaches package-manager grandchildren too.
            cmd.process_group(0);
        }
        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);
        cmd.spawn()
            .with_context(|| format!("spawn {} in {}", argv.join(" "), spec.root.display()))
    }

    async fn wait_for_exit(
        self,
        app_id: String,
        generation: u64,
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        pump: JoinHandle<()>,
        exit_tx: watch::Sender<Option<ExitInfo>>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                if let Err(e) = child.start_kill() {
                    debug!(err = %e, "kill dev server");
                }
                child.wait().await
            }
        };
        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(app_id = %app_id, err = %e, "wait for dev server");
                None
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, pump).await.is_err() {
            debug!(app_id = %app_id, "output still open after exit");
        }
        self.on_exit(&app_id, generation, code);
        let _ = exit_tx.send(Some(ExitInfo { code }));
    }

    /// Exit observed by the waiter. Only an exit nobody asked for is a crash.
    fn on_exit(&self, app_id: &str, generation: u64, code: Option<i32>) {
        let crashed = {
            let mut apps = self.lock();
            let Some(app) = apps.get_mut(app_id) else {
                return;
            };
            if app.generation != generation
                || !matches!(app.handle.state, AppState::Starting | AppState::Running)
            {
                return;
            }
            app.handle.state = AppState::Crashed;
            app.handle.exit_code = code;
            app.handle.pid = None;
            app.handle.proxy_url = None;
            app.process = None;
            (app.handle.clone(), app.proxy.take())
        };
        let (snapshot, proxy) = crashed;
        drop(proxy);
        warn!(app_id, exit_code = ?code, "dev server exited unexpectedly");
        self.record(
            app_id,
            OutputStream::Stderr,
            format!(
                "[appvisor] dev server exited unexpectedly (exit code {})",
                code.map_or_else(|| "none".to_string(), |c| c.to_string())
            ),
        );
        self.publish_state(&snapshot);
    }

    fn start_failure(&self, app_id: &str, generation: u64, code: Option<i32>) -> OrchestratorError {
        let handle = self.status(app_id);
        let ours = self
            .lock()
            .get(app_id)
            .is_some_and(|app| app.generation == generation);
        if ours && handle.state == AppState::Crashed {
            OrchestratorError::ProcessCrashed {
                exit_code: code,
                tail: self.tail(app_id),
            }
        } else {
            self.superseded(app_id)
        }
    }

    fn superseded(&self, app_id: &str) -> OrchestratorError {
        OrchestratorError::InvalidState {
            app_id: app_id.to_string(),
            state: self.status(app_id).state,
            operation: "run",
        }
    }

    /// `from → to` for the current generation only.
    fn advance(
        &self,
        app_id: &str,
        generation: u64,
        from: AppState,
        to: AppState,
    ) -> OrchestratorResult<AppProcessHandle> {
        let mut apps = self.lock();
        match apps.get_mut(app_id) {
            Some(app) if app.generation == generation && app.handle.state == from => {
                app.handle.state = to;
                Ok(app.handle.clone())
            }
            Some(app) => Err(OrchestratorError::InvalidState {
                app_id: app_id.to_string(),
                state: app.handle.state,
                operation: "run",
            }),
            None => Err(OrchestratorError::AppNotFound(app_id.to_string())),
        }
    }

    /// Settle into a terminal state for `generation` and publish it.
    fn finish(
        &self,
        app_id: &str,
        generation: u64,
        state: AppState,
        exit_code: Option<i32>,
    ) -> Option<AppProcessHandle> {
        let snapshot = {
            let mut apps = self.lock();
            let app = apps.get_mut(app_id)?;
            if app.generation != generation {
                return None;
            }
            app.handle.state = state;
            app.handle.pid = None;
            app.handle.proxy_url = None;
            app.handle.exit_code = exit_code;
            app.process = None;
            app.proxy = None;
            app.handle.clone()
        };
        self.publish_state(&snapshot);
        Some(snapshot)
    }

    async fn terminate(&self, mut process: RunningProcess) -> Option<i32> {
        let grace = self.inner.config.stop_grace();
        let signalled = match process.pid {
            Some(pid) => signal_group(pid, "TERM").await,
            None => false,
        };
        if !signalled && let Some(kill) = process.kill_tx.take() {
            let _ = kill.send(());
        }
        if let Ok(code) = tokio::time::timeout(grace, wait_exit(&mut process.exit_rx)).await {
            return code;
        }

        warn!(grace_ms = grace.as_millis() as u64, "grace period elapsed, force-killing");
        if let Some(pid) = process.pid {
            signal_group(pid, "KILL").await;
        }
        if let Some(kill) = process.kill_tx.take() {
            let _ = kill.send(());
        }
        tokio::time::timeout(FORCE_KILL_WAIT, wait_exit(&mut process.exit_rx))
            .await
            .unwrap_or(None)
    }

    fn proxy_options(&self) -> ProxyOptions {
        let cfg = &self.inner.config.proxy;
        ProxyOptions {
            port_range_start: cfg.port_range_start,
            port_range_end: cfg.port_range_end,
            first_port: Some(self.inner.next_proxy_port.load(Ordering::Relaxed)),
            ready_marker: cfg.ready_marker.clone(),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
        }
    }

    fn advance_proxy_cursor(&self, used: u16) {
        let cfg = &self.inner.config.proxy;
        let next = if used >= cfg.port_range_end {
            cfg.port_range_start
        } else {
            used + 1
        };
        self.inner.next_proxy_port.store(next, Ordering::Relaxed);
    }

    fn watch_proxy(
        &self,
        app_id: &str,
        generation: u64,
        mut messages: mpsc::UnboundedReceiver<ProxyMessage>,
    ) {
        let supervisor = self.clone();
        let app_id = app_id.to_string();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                if let ProxyMessage::Exited(Some(reason)) = message {
                    supervisor.on_proxy_failed(&app_id, generation, &reason);
                }
            }
        });
    }

    fn on_proxy_failed(&self, app_id: &str, generation: u64, reason: &str) {
        let snapshot = {
            let mut apps = self.lock();
            let Some(app) = apps.get_mut(app_id) else {
                return;
            };
            if app.generation != generation || app.handle.state != AppState::Running {
                return;
            }
            app.proxy = None;
            app.handle.proxy_url = None;
            app.handle.clone()
        };
        warn!(app_id, reason, "proxy stopped");
        self.record(
            app_id,
            OutputStream::Stderr,
            format!(
                "[appvisor] preview proxy stopped ({reason}); serving {} directly",
                snapshot.original_url.as_deref().unwrap_or("the dev server")
            ),
        );
        self.publish_state(&snapshot);
    }

    fn tail(&self, app_id: &str) -> Vec<String> {
        self.inner
            .detector
            .tail(app_id, self.inner.config.dev.crash_tail_lines)
    }

    fn record(&self, app_id: &str, stream: OutputStream, message: String) {
        self.inner
            .detector
            .ingest(OutputRecord::new(app_id, stream, message));
    }

    fn publish_state(&self, handle: &AppProcessHandle) {
        self.inner.bus.publish(RuntimeEvent::StateChanged {
            app_id: handle.app_id.clone(),
            state: handle.state,
            pid: handle.pid,
            exit_code: handle.exit_code,
        });
    }
}

async fn await_start(
    ready_rx: &mut oneshot::Receiver<String>,
    exit_rx: &mut ExitReceiver,
) -> StartOutcome {
    tokio::select! {
        origin = ready_rx => {
            if let Ok(origin) = origin {
                return StartOutcome::Ready(origin);
            }
        }
        code = wait_exit(exit_rx) => return StartOutcome::Exited(code),
    }
    // Output closed without a ready line; the exit decides.
    StartOutcome::Exited(wait_exit(exit_rx).await)
}

async fn wait_exit(exit_rx: &mut ExitReceiver) -> Option<i32> {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(info) => (*info).and_then(|i| i.code),
        Err(_) => None,
    }
}

async fn read_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(err = %e, ?stream, "output stream closed");
                break;
            }
        }
    }
}

async fn pump_output(
    detector: ErrorDetector,
    ready: ReadyDetector,
    app_id: String,
    mut lines: mpsc::UnboundedReceiver<(OutputStream, String)>,
    ready_tx: oneshot::Sender<String>,
) {
    let mut ready_tx = Some(ready_tx);
    while let Some((stream, line)) = lines.recv().await {
        let origin = if ready_tx.is_some() {
            ready.detect(&line)
        } else {
            None
        };
        detector.ingest(OutputRecord::new(&app_id, stream, line));
        if let Some(origin) = origin
            && let Some(tx) = ready_tx.take()
        {
            let _ = tx.send(origin);
        }
    }
}

/// Signal the child's whole process group. Returns whether `kill` accepted the request.
#[cfg(unix)]
async fn signal_group(pid: u32, signal: &str) -> bool {
    let status = tokio::process::Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {
            debug!(pid, signal, "signalled process group");
            true
        }
        Ok(status) => {
            debug!(pid, signal, ?status, "process group already gone");
            false
        }
        Err(e) => {
            warn!(pid, signal, err = %e, "run kill");
            false
        }
    }
}

#[cfg(not(unix))]
async fn signal_group(_pid: u32, _signal: &str) -> bool {
    false
}
