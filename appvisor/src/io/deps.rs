//! Dependency installation for app projects.

use std::path::Path;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::core::types::OutputStream;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::io::config::DevConfig;
use crate::io::process::{command_from_argv, run_command_streaming};

/// Whether `root` has a manifest and an install command is configured.
pub fn can_install(root: &Path, dev: &DevConfig) -> bool {
    !dev.install_command.is_empty() && root.join(&dev.manifest).is_file()
}

/// Whether `root` has a manifest but no installed dependency directory yet.
pub fn needs_install(root: &Path, dev: &DevConfig) -> bool {
    can_install(root, dev) && !root.join(&dev.dependency_dir).exists()
}

/// Run the install command (or the add-dependency command with `packages`) in `root`.
///
/// Every output line goes to `on_line` so install failures land in the app's output.
#[instrument(skip_all, fields(root = %root.display(), packages = packages.len()))]
pub async fn install<F>(
    root: &Path,
    dev: &DevConfig,
    packages: &[String],
    on_line: F,
) -> OrchestratorResult<()>
where
    F: Fn(OutputStream, &str) + Send + Sync + 'static,
{
    let mut argv = if packages.is_empty() {
        dev.install_command.clone()
    } else {
        dev.add_dependency_command.clone()
    };
    if argv.is_empty() {
        return Err(OrchestratorError::DependencyInstallFailed(
            "no install command configured".to_string(),
        ));
    }
    argv.extend(packages.iter().cloned());

    let mut cmd = command_from_argv(&argv)
        .map_err(|e| OrchestratorError::DependencyInstallFailed(format!("{e:#}")))?;
    cmd.current_dir(root);
    let timeout = Duration::from_secs(dev.install_timeout_secs);
    let limit = dev.install_output_limit_bytes;

    info!(command = %argv.join(" "), "installing dependencies");
    let output = tokio::task::spawn_blocking(move || {
        run_command_streaming(cmd, None, timeout, limit, on_line)
    })
    .await
    .map_err(|e| OrchestratorError::DependencyInstallFailed(format!("join install task: {e}")))?
    .map_err(|e| OrchestratorError::DependencyInstallFailed(format!("{e:#}")))?;

    if output.timed_out {
        warn!("dependency install timed out");
        return Err(OrchestratorError::DependencyInstallFailed(format!(
            "{} timed out after {timeout:?}",
            argv.join(" ")
        )));
    }
    if !output.status.success() {
        warn!(exit_code = ?output.status.code(), "dependency install failed");
        return Err(OrchestratorError::DependencyInstallFailed(format!(
            "{} exited with status {:?}: {}",
            argv.join(" "),
            output.status.code(),
            output.tail(5).join(" | ")
        )));
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::sync::{Arc, Mutex};

    use super::*;

    fn dev(install: &[&str], add: &[&str]) -> DevConfig {
        DevConfig {
            install_command: install.iter().map(|s| (*s).to_string()).collect(),
            add_dependency_command: add.iter().map(|s| (*s).to_string()).collect(),
            install_timeout_secs: 5,
            ..DevConfig::default()
        }
    }

    #[test]
    fn install_needed_only_with_manifest_and_no_dependency_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = DevConfig::default();
        assert!(!needs_install(temp.path(), &cfg));
        fs::write(temp.path().join("package.json"), "{}").expect("write");
        assert!(needs_install(temp.path(), &cfg));
        fs::create_dir(temp.path().join("node_modules")).expect("mkdir");
        assert!(!needs_install(temp.path(), &cfg));
    }

    #[tokio::test]
    async fn packages_are_appended_to_the_add_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = dev(&["true"], &["/bin/sh", "-c", "echo \"$@\" > added.txt", "sh"]);
        install(temp.path(), &cfg, &["uuid".to_string(), "zod".to_string()], |_, _| {})
            .await
            .expect("install");
        let added = fs::read_to_string(temp.path().join("added.txt")).expect("read");
        assert_eq!(added.trim(), "uuid zod");
    }

    #[tokio::test]
    async fn failure_reports_output_and_streams_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = dev(&["/bin/sh", "-c", "echo 'npm ERR! 404' >&2; exit 1"], &[]);
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let err = install(temp.path(), &cfg, &[], move |_, line| {
            sink.lock().expect("lock").push(line.to_string());
        })
        .await
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::DependencyInstallFailed(_)));
        assert!(err.to_string().contains("npm ERR! 404"));
        assert_eq!(*lines.lock().expect("lock"), vec!["npm ERR! 404".to_string()]);
    }
}
