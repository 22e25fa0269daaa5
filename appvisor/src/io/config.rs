//! Orchestrator configuration stored as TOML (default `.appvisor/config.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::classifier::{Classifier, PatternConfig};
use crate::core::ready::{ReadyDetector, default_ready_patterns};

pub const DEFAULT_CONFIG_PATH: &str = ".appvisor/config.toml";

/// Orchestrator configuration (TOML).
///
/// Meant to be edited by humans. Missing fields default to values that suit an
/// npm-based generated app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppvisorConfig {
    pub dev: DevConfig,
    pub proxy: ProxyConfig,
    pub classifier: ClassifierConfig,
    pub fix: FixConfig,
    pub agent: AgentConfig,
    pub terminal: TerminalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DevConfig {
    /// Dev-server command, run in the project root.
    pub command: Vec<String>,
    /// Dependency install command; empty disables installs.
    pub install_command: Vec<String>,
    /// Command that adds packages; the package names are appended.
    pub add_dependency_command: Vec<String>,
    /// Dependency cache directory, relative to the project root.
    pub dependency_dir: String,
    /// Dependency manifest, relative to the project root.
    pub manifest: String,
    /// Regexes that mark a "server ready" line.
    pub ready_patterns: Vec<String>,
    pub ready_timeout_secs: u64,
    pub stop_grace_ms: u64,
    pub install_timeout_secs: u64,
    pub install_output_limit_bytes: usize,
    /// Per-app output ring buffer capacity (lines).
    pub output_buffer_lines: usize,
    /// Per-app runtime error buffer capacity.
    pub runtime_error_buffer: usize,
    /// Output lines attached to crash and timeout messages.
    pub crash_tail_lines: usize,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            command: strings(&["npm", "run", "dev"]),
            install_command: strings(&["npm", "install"]),
            add_dependency_command: strings(&["npm", "install"]),
            dependency_dir: "node_modules".to_string(),
            manifest: "package.json".to_string(),
            ready_patterns: default_ready_patterns(),
            ready_timeout_secs: 60,
            stop_grace_ms: 3_000,
            install_timeout_secs: 10 * 60,
            install_output_limit_bytes: 200_000,
            output_buffer_lines: 1_000,
            runtime_error_buffer: 100,
            crash_tail_lines: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    /// When false the preview loads the dev server directly.
    pub enabled: bool,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Prefix of the proxy worker's readiness message.
    pub ready_marker: String,
    pub request_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port_range_start: 51_000,
            port_range_end: 51_999,
            ready_marker: "[appvisor-proxy-started]".to_string(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Window after new output before the report is recomputed.
    pub debounce_ms: u64,
    /// Also scan stdout (some dev servers print compile errors there).
    pub scan_stdout: bool,
    /// Extra matchers, tried before the built-in ones.
    pub patterns: Vec<PatternConfig>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 750,
            scan_stdout: false,
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FixConfig {
    pub max_attempts: u32,
    /// Wall-clock ceiling for one attempt (agent call, edits, settle).
    pub attempt_timeout_secs: u64,
    /// Quiet period after edits before the fresh report is taken.
    pub settle_ms: u64,
}

impl Default for FixConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            attempt_timeout_secs: 5 * 60,
            settle_ms: 1_500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI; receives the prompt on stdin, answers on stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: strings(&["codex", "exec", "--skip-git-repo-check", "-"]),
            timeout_secs: 10 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell binary; empty means `$SHELL`, falling back to `/bin/sh`.
    pub shell: String,
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: String::new(),
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl TerminalConfig {
    pub fn resolved_shell(&self) -> String {
        if !self.shell.trim().is_empty() {
            return self.shell.clone();
        }
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

impl AppvisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dev.command.is_empty() || self.dev.command[0].trim().is_empty() {
            return Err(anyhow!("dev.command must be a non-empty array"));
        }
        if self.dev.output_buffer_lines == 0 {
            return Err(anyhow!("dev.output_buffer_lines must be > 0"));
        }
        if self.dev.runtime_error_buffer == 0 {
            return Err(anyhow!("dev.runtime_error_buffer must be > 0"));
        }
        if self.dev.ready_timeout_secs == 0 {
            return Err(anyhow!("dev.ready_timeout_secs must be > 0"));
        }
        if self.dev.install_timeout_secs == 0 {
            return Err(anyhow!("dev.install_timeout_secs must be > 0"));
        }
        if self.proxy.port_range_start == 0 || self.proxy.port_range_start > self.proxy.port_range_end
        {
            return Err(anyhow!(
                "proxy port range {}..={} is empty",
                self.proxy.port_range_start,
                self.proxy.port_range_end
            ));
        }
        if self.proxy.ready_marker.trim().is_empty() {
            return Err(anyhow!("proxy.ready_marker must not be empty"));
        }
        if self.fix.max_attempts == 0 {
            return Err(anyhow!("fix.max_attempts must be > 0"));
        }
        if self.fix.attempt_timeout_secs == 0 {
            return Err(anyhow!("fix.attempt_timeout_secs must be > 0"));
        }
        if self.agent.timeout_secs == 0 || self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.timeout_secs and agent.output_limit_bytes must be > 0"));
        }
        ReadyDetector::new(&self.dev.ready_patterns)?;
        self.classifier()?;
        Ok(())
    }

    pub fn classifier(&self) -> Result<Classifier> {
        Classifier::new(&self.classifier.patterns, self.classifier.scan_stdout)
    }

    pub fn ready_detector(&self) -> Result<ReadyDetector> {
        ReadyDetector::new(&self.dev.ready_patterns)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.classifier.debounce_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.dev.stop_grace_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AppvisorConfig::default()`.
pub fn load_config(path: &Path) -> Result<AppvisorConfig> {
    if !path.exists() {
        let cfg = AppvisorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AppvisorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AppvisorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}
