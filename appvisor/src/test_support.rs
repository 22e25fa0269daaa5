//! Test doubles and fixtures: scripted agents, scripted fix targets, throwaway dev servers.

use std::collections::VecDeque;
use std::fs;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tempfile::TempDir;

use crate::core::types::{AppSpec, BuildError, ErrorReport};
use crate::error::OrchestratorResult;
use crate::fix::FixTarget;
use crate::io::agent::Agent;
use crate::io::config::AppvisorConfig;

/// One canned agent reply.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Reply(String),
    Fail(String),
}

/// Agent that answers from a queue and records every prompt it was sent.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedAgent {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    pub fn replies(replies: &[&str]) -> Self {
        Self::new(
            replies
                .iter()
                .map(|r| ScriptedResponse::Reply((*r).to_string()))
                .collect(),
        )
    }

    /// Sleep before answering, to simulate a slow model.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.responses.lock().expect("responses lock").pop_front();
        match next {
            Some(ScriptedResponse::Reply(text)) => Ok(text),
            Some(ScriptedResponse::Fail(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted agent has no responses left")),
        }
    }
}

/// Fix target backed by a temp directory and a queue of post-attempt reports.
#[derive(Debug)]
pub struct ScriptedFixTarget {
    root: PathBuf,
    reports: Mutex<VecDeque<ErrorReport>>,
    running: AtomicBool,
    restarts: AtomicUsize,
    installs: Mutex<Vec<Vec<String>>>,
    marker: AtomicUsize,
}

impl ScriptedFixTarget {
    /// `reports` are handed out one per attempt; an exhausted queue means "no errors".
    pub fn new(root: impl Into<PathBuf>, reports: Vec<ErrorReport>) -> Self {
        Self {
            root: root.into(),
            reports: Mutex::new(reports.into()),
            running: AtomicBool::new(true),
            restarts: AtomicUsize::new(0),
            installs: Mutex::new(Vec::new()),
            marker: AtomicUsize::new(0),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn installs(&self) -> Vec<Vec<String>> {
        self.installs.lock().expect("installs lock").clone()
    }
}

#[async_trait]
impl FixTarget for ScriptedFixTarget {
    fn project_root(&self, _app_id: &str) -> OrchestratorResult<PathBuf> {
        Ok(self.root.clone())
    }

    async fn install_dependencies(
        &self,
        _app_id: &str,
        packages: &[String],
    ) -> OrchestratorResult<()> {
        self.installs
            .lock()
            .expect("installs lock")
            .push(packages.to_vec());
        Ok(())
    }

    fn is_running(&self, _app_id: &str) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn restart(&self, _app_id: &str) -> OrchestratorResult<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn report_marker(&self, _app_id: &str) -> u64 {
        self.marker.fetch_add(1, Ordering::SeqCst) as u64
    }

    async fn fresh_report(&self, _app_id: &str, _marker: u64) -> ErrorReport {
        self.reports
            .lock()
            .expect("reports lock")
            .pop_front()
            .unwrap_or_else(ErrorReport::empty)
    }
}

/// A report with one located build error per `(file, line, message)`.
pub fn report_with_build_errors(errors: &[(&str, u32, &str)]) -> ErrorReport {
    let build_errors: Vec<BuildError> = errors
        .iter()
        .map(|(file, line, message)| BuildError {
            file: Some((*file).to_string()),
            line: Some(*line),
            column: Some(1),
            message: (*message).to_string(),
            code: None,
        })
        .collect();
    ErrorReport {
        has_errors: !build_errors.is_empty(),
        build_errors,
        runtime_errors: Vec::new(),
        generated_at: chrono::Utc::now(),
    }
}

/// A free loopback range of `width` ports, starting at an OS-assigned port.
pub fn free_port_range(width: u16) -> Result<(u16, u16)> {
    let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).context("bind probe")?;
    let start = probe.local_addr().context("probe addr")?.port();
    drop(probe);
    Ok((start, start.saturating_add(width.saturating_sub(1))))
}

/// A project directory with a shell-script dev server.
pub struct TestApp {
    temp: TempDir,
    pub spec: AppSpec,
}

impl TestApp {
    /// Write `dev.sh` with `script` into a fresh temp project.
    pub fn new(id: &str, script: &str) -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        write_file(temp.path(), "dev.sh", script)?;
        let spec = AppSpec::new(id, format!("{id} app"), temp.path());
        Ok(Self { temp, spec })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        write_file(self.root(), rel, contents)
    }

    /// Config that runs `sh dev.sh` with short timeouts and a free proxy range.
    pub fn config(&self) -> Result<AppvisorConfig> {
        let (start, end) = free_port_range(200)?;
        let mut cfg = AppvisorConfig::default();
        cfg.dev.command = vec!["/bin/sh".to_string(), "dev.sh".to_string()];
        cfg.dev.ready_timeout_secs = 10;
        cfg.dev.stop_grace_ms = 1_000;
        cfg.dev.install_timeout_secs = 10;
        cfg.proxy.port_range_start = start;
        cfg.proxy.port_range_end = end;
        cfg.classifier.debounce_ms = 50;
        cfg.fix.settle_ms = 200;
        Ok(cfg)
    }
}

pub fn write_file(root: &Path, rel: &str, contents: &str) -> Result<PathBuf> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Poll `condition` every 20ms until it holds or `timeout` passes.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
