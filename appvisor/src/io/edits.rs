//! Apply file directives to a project tree.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};

use crate::core::directives::resolve_in_root;
use crate::core::types::EditDirective;
use crate::error::{OrchestratorError, OrchestratorResult};

/// Apply one write or delete directive under `root`.
///
/// `AddDependency` is not a file edit; callers route it to the dependency installer and
/// this returns `Ok(())` for it unchanged.
#[instrument(skip_all, fields(root = %root.display(), edit = %directive.describe()))]
pub fn apply_file_edit(root: &Path, directive: &EditDirective) -> OrchestratorResult<()> {
    match directive {
        EditDirective::Write { path, content } => {
            let target = resolve(root, path)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    OrchestratorError::EditApplyFailed(format!(
                        "create directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
            write_atomic(&target, content)?;
            info!(path, bytes = content.len(), "wrote file");
        }
        EditDirective::Delete { path } => {
            let target = resolve(root, path)?;
            match fs::remove_file(&target) {
                Ok(()) => info!(path, "deleted file"),
                // Already gone is the state the agent asked for.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path, "delete target already absent");
                }
                Err(e) => {
                    return Err(OrchestratorError::EditApplyFailed(format!(
                        "delete {}: {e}",
                        target.display()
                    )));
                }
            }
        }
        EditDirective::AddDependency { .. } => {}
    }
    Ok(())
}

/// Write through a sibling temp file and rename it over `target`, so a reader (or a crash)
/// never sees a half-written source file.
fn write_atomic(target: &Path, content: &str) -> OrchestratorResult<()> {
    let failed = |what: &str, e: std::io::Error| {
        OrchestratorError::EditApplyFailed(format!("{what} {}: {e}", target.display()))
    };
    let parent = target.parent().ok_or_else(|| {
        OrchestratorError::EditApplyFailed(format!("{} has no parent", target.display()))
    })?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| failed("create temp file for", e))?;
    if let Some(permissions) = target_permissions(target) {
        tmp.as_file()
            .set_permissions(permissions)
            .map_err(|e| failed("set permissions for", e))?;
    }
    tmp.write_all(content.as_bytes())
        .map_err(|e| failed("write temp file for", e))?;
    tmp.persist(target).map_err(|e| failed("replace", e.error))?;
    Ok(())
}

/// Keep an existing file's mode; new files get the usual 0644 instead of the temp file's 0600.
fn target_permissions(target: &Path) -> Option<fs::Permissions> {
    if let Ok(meta) = fs::metadata(target) {
        return Some(meta.permissions());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Some(fs::Permissions::from_mode(0o644))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

fn resolve(root: &Path, rel: &str) -> OrchestratorResult<std::path::PathBuf> {
    resolve_in_root(root, rel).map_err(|e| OrchestratorError::EditApplyFailed(format!("{e:#}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_parent_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let edit = EditDirective::Write {
            path: "src/components/Button.tsx".to_string(),
            content: "export {};\n".to_string(),
        };
        apply_file_edit(temp.path(), &edit).expect("apply");
        let written =
            fs::read_to_string(temp.path().join("src/components/Button.tsx")).expect("read");
        assert_eq!(written, "export {};\n");
    }

    #[test]
    fn rewrite_replaces_content_and_leaves_no_temp_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("App.tsx"), "old contents that are longer\n").expect("seed");
        let edit = EditDirective::Write {
            path: "App.tsx".to_string(),
            content: "new\n".to_string(),
        };
        apply_file_edit(temp.path(), &edit).expect("apply");

        assert_eq!(
            fs::read_to_string(temp.path().join("App.tsx")).expect("read"),
            "new\n"
        );
        let entries: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("App.tsx")]);
    }

    #[test]
    fn delete_tolerates_missing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("old.ts"), "x").expect("write");
        let edit = EditDirective::Delete {
            path: "old.ts".to_string(),
        };
        apply_file_edit(temp.path(), &edit).expect("first delete");
        apply_file_edit(temp.path(), &edit).expect("second delete");
        assert!(!temp.path().join("old.ts").exists());
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let edit = EditDirective::Write {
            path: "../outside.txt".to_string(),
            content: "nope".to_string(),
        };
        let err = apply_file_edit(temp.path(), &edit).unwrap_err();
        assert!(matches!(err, OrchestratorError::EditApplyFailed(_)));
    }
}
