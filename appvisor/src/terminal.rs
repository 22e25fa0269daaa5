//! Terminal Session Manager: interactive shells under a pseudo-terminal.
//!
//! Input is forwarded to the shell as it arrives while the manager mirrors the current line.
//! A completed line that names a control command (see [`TerminalCommand`]) is cancelled in
//! the shell and handled here instead, for sessions bound to an app.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use crate::core::command::{HELP_TEXT, TerminalCommand};
use crate::core::types::{FixOutcome, FixStatus, TerminalSession};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::io::config::TerminalConfig;

const EVENT_CAPACITY: usize = 1024;
const READ_CHUNK: usize = 4096;
/// Ctrl-U: discard the shell's pending line.
const KILL_LINE: u8 = 0x15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEvent {
    Data { session_id: String, data: String },
    Exit {
        session_id: String,
        exit_code: Option<u32>,
    },
}

impl TerminalEvent {
    pub fn session_id(&self) -> &str {
        match self {
            TerminalEvent::Data { session_id, .. } | TerminalEvent::Exit { session_id, .. } => {
                session_id
            }
        }
    }
}

/// Handles control commands typed into app-bound sessions.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn fix(&self, app_id: &str) -> OrchestratorResult<FixOutcome>;

    fn clear_errors(&self, app_id: &str);
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionRequest {
    pub app_id: Option<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

struct Session {
    info: TerminalSession,
    master: Box<dyn MasterPty + Send>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    line: Vec<u8>,
}

struct Inner {
    sessions: Mutex<HashMap<String, Session>>,
    events: broadcast::Sender<TerminalEvent>,
    config: TerminalConfig,
    handler: Option<Weak<dyn ControlHandler>>,
}

#[derive(Clone)]
pub struct TerminalManager {
    inner: Arc<Inner>,
}

impl TerminalManager {
    pub fn new(config: TerminalConfig) -> Self {
        Self::build(config, None)
    }

    /// A manager that dispatches control commands to `handler` while it is alive.
    pub fn with_handler(config: TerminalConfig, handler: Weak<dyn ControlHandler>) -> Self {
        Self::build(config, Some(handler))
    }

    fn build(config: TerminalConfig, handler: Option<Weak<dyn ControlHandler>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                events,
                config,
                handler,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn an interactive shell rooted at `request.cwd`.
    #[instrument(skip_all, fields(app_id = ?request.app_id, cwd = %request.cwd.display()))]
    pub fn create_session(&self, request: SessionRequest) -> OrchestratorResult<TerminalSession> {
        let cols = request.cols.unwrap_or(self.inner.config.default_cols);
        let rows = request.rows.unwrap_or(self.inner.config.default_rows);
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| OrchestratorError::ProcessSpawnFailed(format!("open pty: {e:#}")))?;

        let shell = self.inner.config.resolved_shell();
        let mut cmd = CommandBuilder::new(&shell);
        cmd.cwd(&request.cwd);
        if std::env::var_os("TERM").is_none() {
            cmd.env("TERM", "xterm-256color");
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| OrchestratorError::ProcessSpawnFailed(format!("spawn {shell}: {e:#}")))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("clone pty reader")?;
        let writer = pair.master.take_writer().context("take pty writer")?;
        let killer = child.clone_killer();

        let session_id = uuid::Uuid::new_v4().to_string();
        let info = TerminalSession {
            session_id: session_id.clone(),
            app_id: request.app_id,
            pid: child.process_id(),
            cwd: request.cwd,
            cols,
            rows,
        };
        self.lock().insert(
            session_id.clone(),
            Session {
                info: info.clone(),
                master: pair.master,
                writer: Arc::new(Mutex::new(writer)),
                killer,
                line: Vec::new(),
            },
        );

        let events = self.inner.events.clone();
        let registry = Arc::downgrade(&self.inner);
        let reader_id = session_id.clone();
        thread::Builder::new()
            .name(format!("appvisor-pty-{}", &session_id[..8]))
            .spawn(move || {
                pump_pty(&reader_id, reader, &events);
                let exit_code = match child.wait() {
                    Ok(status) => Some(status.exit_code()),
                    Err(e) => {
                        debug!(session_id = %reader_id, err = %e, "wait for shell");
                        None
                    }
                };
                if let Some(inner) = registry.upgrade() {
                    inner
                        .sessions
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&reader_id);
                }
                debug!(session_id = %reader_id, ?exit_code, "shell exited");
                let _ = events.send(TerminalEvent::Exit {
                    session_id: reader_id,
                    exit_code,
                });
            })
            .context("spawn pty reader thread")?;

        info!(session_id = %info.session_id, pid = ?info.pid, "terminal session created");
        Ok(info)
    }

    /// Forward raw input, intercepting completed control-command lines.
    pub fn write(&self, session_id: &str, data: &[u8]) -> OrchestratorResult<()> {
        let (app_id, commands, writer, forward) = {
            let mut sessions = self.lock();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
            let intercept = session.info.app_id.is_some() && self.inner.handler.is_some();
            let mut forward = Vec::with_capacity(data.len());
            let mut commands = Vec::new();
            for &byte in data {
                match byte {
                    b'\r' | b'\n' => {
                        let line = String::from_utf8_lossy(&session.line).into_owned();
                        session.line.clear();
                        let command = TerminalCommand::parse(&line);
                        if intercept && command.is_control() {
                            forward.extend_from_slice(&[KILL_LINE, b'\r']);
                            commands.push(command);
                        } else {
                            forward.push(byte);
                        }
                    }
                    0x7f | 0x08 => {
                        session.line.pop();
                        forward.push(byte);
                    }
                    // Ctrl-C and Ctrl-U abandon the line in the shell too.
                    0x03 | KILL_LINE => {
                        session.line.clear();
                        forward.push(byte);
                    }
                    _ => {
                        session.line.push(byte);
                        forward.push(byte);
                    }
                }
            }
            (
                session.info.app_id.clone(),
                commands,
                Arc::clone(&session.writer),
                forward,
            )
        };

        // Outside the registry lock; a stalled shell only blocks its own writers.
        {
            let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
            writer
                .write_all(&forward)
                .and_then(|()| writer.flush())
                .context("write to pty")?;
        }

        if let Some(app_id) = app_id {
            for command in commands {
                self.dispatch(session_id, &app_id, command);
            }
        }
        Ok(())
    }

    fn dispatch(&self, session_id: &str, app_id: &str, command: TerminalCommand) {
        let Some(handler) = self.inner.handler.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        debug!(session_id, app_id, ?command, "control command");
        match command {
            TerminalCommand::Help => self.print(session_id, HELP_TEXT),
            TerminalCommand::ClearErrors => {
                handler.clear_errors(app_id);
                self.print(session_id, &format!("[appvisor] cleared errors for {app_id}\n"));
            }
            TerminalCommand::Fix => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    self.print(session_id, "[appvisor] auto-fix needs an async runtime\n");
                    return;
                };
                self.print(session_id, &format!("[appvisor] running auto-fix for {app_id}...\n"));
                let terminals = self.clone();
                let session_id = session_id.to_string();
                let app_id = app_id.to_string();
                runtime.spawn(async move {
                    let summary = match handler.fix(&app_id).await {
                        Ok(outcome) => describe_outcome(&outcome),
                        Err(err) => format!("[appvisor] auto-fix failed: {err}\n"),
                    };
                    terminals.print(&session_id, &summary);
                });
            }
            TerminalCommand::PassThrough(_) => {}
        }
    }

    /// Show `text` in the session's output without involving the shell.
    pub fn print(&self, session_id: &str, text: &str) {
        let _ = self.inner.events.send(TerminalEvent::Data {
            session_id: session_id.to_string(),
            data: text.replace('\n', "\r\n"),
        });
    }

    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> OrchestratorResult<()> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        session
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow!("resize pty: {e:#}"))?;
        session.info.cols = cols;
        session.info.rows = rows;
        Ok(())
    }

    /// Terminate one session. Its `Exit` event follows once the shell is gone.
    pub fn kill(&self, session_id: &str) -> OrchestratorResult<()> {
        let session = self
            .lock()
            .remove(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        terminate(session);
        Ok(())
    }

    /// Terminate every session bound to `app_id`; returns how many were killed.
    pub fn kill_sessions_for_app(&self, app_id: &str) -> usize {
        let doomed: Vec<Session> = {
            let mut sessions = self.lock();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.info.app_id.as_deref() == Some(app_id))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        let count = doomed.len();
        doomed.into_iter().for_each(terminate);
        if count > 0 {
            info!(app_id, count, "killed app terminal sessions");
        }
        count
    }

    pub fn kill_all(&self) {
        let doomed: Vec<Session> = self.lock().drain().map(|(_, s)| s).collect();
        doomed.into_iter().for_each(terminate);
    }

    pub fn sessions(&self) -> Vec<TerminalSession> {
        let mut sessions: Vec<_> = self.lock().values().map(|s| s.info.clone()).collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn session(&self, session_id: &str) -> Option<TerminalSession> {
        self.lock().get(session_id).map(|s| s.info.clone())
    }
}

fn terminate(mut session: Session) {
    if let Err(e) = session.killer.kill() {
        debug!(session_id = %session.info.session_id, err = %e, "kill shell");
    }
}

fn pump_pty(session_id: &str, mut reader: Box<dyn Read + Send>, events: &broadcast::Sender<TerminalEvent>) {
    let mut buf = [0u8; READ_CHUNK];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let data = take_utf8(&mut pending);
                if data.is_empty() {
                    continue;
                }
                let _ = events.send(TerminalEvent::Data {
                    session_id: session_id.to_string(),
                    data,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                // Linux reports EIO once the shell side closes.
                debug!(session_id, err = %e, "pty read ended");
                break;
            }
        }
    }
    if !pending.is_empty() {
        let _ = events.send(TerminalEvent::Data {
            session_id: session_id.to_string(),
            data: String::from_utf8_lossy(&pending).into_owned(),
        });
    }
}

/// Decode as much of `pending` as forms whole characters, leaving a split
/// trailing sequence for the next read. Invalid bytes decode lossily.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    let mut rest: &[u8] = pending;
    loop {
        match std::str::from_utf8(rest) {
            Ok(text) => {
                out.push_str(text);
                rest = &[];
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                out.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    }
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }
    let tail = rest.to_vec();
    *pending = tail;
    out
}

/// One-paragraph summary of a finished fix loop, for the terminal.
pub fn describe_outcome(outcome: &FixOutcome) -> String {
    let mut out = String::new();
    for attempt in &outcome.attempts {
        let detail = match (&attempt.error, &attempt.resulting_error_report) {
            (Some(error), _) => format!("failed: {error}"),
            (None, Some(report)) => format!(
                "{} edit(s), {} error(s) remaining",
                attempt.applied_edits.len(),
                report.error_count()
            ),
            (None, None) => "no result".to_string(),
        };
        out.push_str(&format!(
            "[appvisor] attempt {}: {detail}\n",
            attempt.attempt_number
        ));
    }
    let status = match outcome.status {
        FixStatus::Fixed if outcome.attempts.is_empty() => "no errors to fix".to_string(),
        FixStatus::Fixed => "errors fixed".to_string(),
        FixStatus::Cancelled => "auto-fix cancelled".to_string(),
        FixStatus::Exhausted => format!(
            "errors remain after {} attempt(s); handle them manually",
            outcome.attempts.len()
        ),
    };
    out.push_str(&format!("[appvisor] {status}\n"));
    if let Some(remaining) = &outcome.remaining {
        for err in &remaining.build_errors {
            let location = err.file.as_deref().unwrap_or("(no location)");
            out.push_str(&format!("  {location}: {}\n", err.message));
        }
        for err in &remaining.runtime_errors {
            out.push_str(&format!("  {}: {}\n", err.kind, err.message));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ErrorReport, FixAttempt};

    fn outcome(status: FixStatus, attempts: Vec<FixAttempt>, remaining: Option<ErrorReport>) -> FixOutcome {
        FixOutcome {
            app_id: "a".to_string(),
            status,
            attempts,
            remaining,
        }
    }

    #[test]
    fn summary_for_nothing_to_fix() {
        let text = describe_outcome(&outcome(FixStatus::Fixed, Vec::new(), None));
        assert_eq!(text, "[appvisor] no errors to fix\n");
    }

    #[test]
    fn summary_lists_attempts_and_remaining_errors() {
        let attempt = FixAttempt {
            attempt_number: 1,
            prompt: String::new(),
            response: None,
            applied_edits: Vec::new(),
            resulting_error_report: None,
            error: Some("agent invocation failed: boom".to_string()),
        };
        let mut remaining = ErrorReport::empty();
        remaining.has_errors = true;
        remaining.build_errors.push(crate::core::types::BuildError {
            file: Some("src/App.tsx".to_string()),
            line: Some(1),
            column: None,
            message: "Unexpected token".to_string(),
            code: None,
        });

        let text = describe_outcome(&outcome(FixStatus::Exhausted, vec![attempt], Some(remaining)));

        assert!(text.contains("attempt 1: failed: agent invocation failed: boom"));
        assert!(text.contains("errors remain after 1 attempt(s)"));
        assert!(text.contains("src/App.tsx: Unexpected token"));
    }

    #[test]
    fn unknown_sessions_are_reported() {
        let terminals = TerminalManager::new(TerminalConfig::default());
        assert!(matches!(
            terminals.write("nope", b"ls\r"),
            Err(OrchestratorError::SessionNotFound(_))
        ));
        assert!(matches!(
            terminals.kill("nope"),
            Err(OrchestratorError::SessionNotFound(_))
        ));
        assert!(terminals.sessions().is_empty());
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let event = TerminalEvent::Exit {
            session_id: "s".to_string(),
            exit_code: Some(0),
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["type"], "exit");
        assert_eq!(json["exit_code"], 0);
        assert_eq!(event.session_id(), "s");
    }

    #[test]
    fn characters_split_across_reads_are_reassembled() {
        let bytes = "héllo ✓".as_bytes();
        // Cut inside the three-byte check mark.
        let cut = bytes.len() - 1;
        let mut pending = bytes[..cut].to_vec();
        assert_eq!(take_utf8(&mut pending), "héllo ");
        assert_eq!(pending.len(), 2);
        pending.extend_from_slice(&bytes[cut..]);
        assert_eq!(take_utf8(&mut pending), "✓");
        assert!(pending.is_empty());
    }

    #[test]
    fn invalid_bytes_are_replaced_not_held_back() {
        let mut pending = b"a\xffb".to_vec();
        assert_eq!(take_utf8(&mut pending), "a\u{fffd}b");
        assert!(pending.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn a_blocked_writer_does_not_hold_up_other_sessions() {
        let manager = TerminalManager::new(TerminalConfig {
            shell: "/bin/sh".to_string(),
            ..TerminalConfig::default()
        });
        let request = || SessionRequest {
            cwd: std::env::temp_dir(),
            ..SessionRequest::default()
        };
        let stuck = manager.create_session(request()).expect("stuck session");
        let live = manager.create_session(request()).expect("live session");

        let stuck_writer = Arc::clone(&manager.lock()[&stuck.session_id].writer);
        let held = stuck_writer.lock().expect("writer lock");

        let (tx, rx) = std::sync::mpsc::channel();
        let other = manager.clone();
        let live_id = live.session_id.clone();
        thread::spawn(move || {
            let _ = tx.send(other.write(&live_id, b"echo hi\r").is_ok());
        });
        let written = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("write finished while another session's writer was held");
        assert!(written);
        assert!(manager.session(&stuck.session_id).is_some());

        drop(held);
        manager.kill_all();
    }
}
