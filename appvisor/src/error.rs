//! Error taxonomy shared by every orchestrator component.

use thiserror::Error;

use crate::core::types::AppState;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("no free port in {start}..={end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    #[error("process crashed with exit code {}{}", fmt_code(.exit_code), fmt_tail(.tail))]
    ProcessCrashed {
        exit_code: Option<i32>,
        tail: Vec<String>,
    },

    #[error("dev server did not report readiness within {secs}s{}", fmt_tail(.tail))]
    ReadyTimeout { secs: u64, tail: Vec<String> },

    #[error("proxy failed to bind: {0}")]
    ProxyBindFailed(String),

    #[error("invalid proxy target: {0}")]
    InvalidTarget(String),

    #[error("dependency install failed: {0}")]
    DependencyInstallFailed(String),

    #[error("agent invocation failed: {0}")]
    AgentInvocationFailed(String),

    #[error("failed to apply edit: {0}")]
    EditApplyFailed(String),

    #[error("terminal session not found: {0}")]
    SessionNotFound(String),

    #[error("app not found: {0}")]
    AppNotFound(String),

    #[error("cannot {operation} app {app_id} while it is {state}")]
    InvalidState {
        app_id: String,
        state: AppState,
        operation: &'static str,
    },

    #[error("auto-fix already running for app {0}")]
    FixInProgress(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn fmt_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none (killed by signal)".to_string(), |c| c.to_string())
}

fn fmt_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        return String::new();
    }
    format!("\nlast output:\n{}", tail.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_message_includes_exit_code_and_tail() {
        let err = OrchestratorError::ProcessCrashed {
            exit_code: Some(1),
            tail: vec!["Error: boom".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code 1"));
        assert!(msg.contains("Error: boom"));
    }

    #[test]
    fn invalid_state_names_operation() {
        let err = OrchestratorError::InvalidState {
            app_id: "a".to_string(),
            state: AppState::Stopping,
            operation: "run",
        };
        assert_eq!(err.to_string(), "cannot run app a while it is stopping");
    }
}
