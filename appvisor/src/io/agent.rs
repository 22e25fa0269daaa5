//! Agent abstraction for fix generation.
//!
//! The [`Agent`] trait decouples the auto-fix loop from the backend that turns a prompt
//! into edit directives. [`CommandAgent`] pipes the prompt into a configured CLI; tests use
//! scripted agents that return canned responses without spawning anything.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::io::config::AgentConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

#[async_trait]
pub trait Agent: Send + Sync {
    /// Send `prompt` and return the agent's raw text response.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Runs an external agent CLI: prompt on stdin, response on stdout.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    argv: Vec<String>,
    workdir: Option<PathBuf>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandAgent {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            argv: config.command.clone(),
            workdir: None,
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    /// Run the agent inside the app's project directory.
    pub fn in_dir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

#[async_trait]
impl Agent for CommandAgent {
    #[instrument(skip_all, fields(program = %self.argv.first().map_or("", String::as_str), timeout_secs = self.timeout.as_secs()))]
    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut cmd = command_from_argv(&self.argv)?;
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        let input = prompt.as_bytes().to_vec();
        let timeout = self.timeout;
        let limit = self.output_limit_bytes;

        info!("invoking agent");
        let output = tokio::task::spawn_blocking(move || {
            run_command_with_timeout(cmd, Some(&input), timeout, limit)
        })
        .await
        .context("join agent task")?
        .context("run agent command")?;

        if output.timed_out {
            warn!("agent timed out");
            return Err(anyhow!("agent timed out after {timeout:?}"));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(anyhow!(
                "agent exited with status {:?}: {}",
                output.status.code(),
                output.tail(5).join(" | ")
            ));
        }
        let response = output.stdout_lossy();
        debug!(
            bytes = response.len(),
            truncated = output.stdout_truncated,
            "agent responded"
        );
        Ok(response)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn agent(argv: &[&str]) -> CommandAgent {
        CommandAgent::new(&AgentConfig {
            command: argv.iter().map(|s| (*s).to_string()).collect(),
            timeout_secs: 5,
            output_limit_bytes: 10_000,
        })
    }

    #[tokio::test]
    async fn prompt_goes_to_stdin_and_stdout_comes_back() {
        let response = agent(&["/bin/sh", "-c", "tr a-z A-Z"])
            .complete("fix it")
            .await
            .expect("complete");
        assert_eq!(response, "FIX IT");
    }

    #[tokio::test]
    async fn large_prompts_round_trip_through_a_streaming_agent() {
        let agent = CommandAgent::new(&AgentConfig {
            command: vec!["cat".to_string()],
            timeout_secs: 10,
            output_limit_bytes: 1024 * 1024,
        });
        let prompt = "a".repeat(512 * 1024);
        let response = agent.complete(&prompt).await.expect("complete");
        assert_eq!(response.len(), prompt.len());
    }

    #[tokio::test]
    async fn runs_in_the_configured_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "here").expect("write");
        let response = agent(&["/bin/sh", "-c", "cat marker.txt"])
            .in_dir(temp.path())
            .complete("")
            .await
            .expect("complete");
        assert_eq!(response, "here");
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let err = agent(&["/bin/sh", "-c", "echo nope >&2; exit 3"])
            .complete("x")
            .await
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("Some(3)"), "{msg}");
        assert!(msg.contains("nope"), "{msg}");
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        assert!(agent(&["/no/such/agent"]).complete("x").await.is_err());
    }
}
