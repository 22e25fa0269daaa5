//! Parsing of file-edit directives out of an agent response.
//!
//! Recognized tags, in any order and mixed with free text:
//!
//! ```text
//! <app-write path="src/App.tsx">...file contents...</app-write>
//! <app-delete path="src/old.ts"></app-delete>      or  <app-delete path="src/old.ts" />
//! <app-add-dependency packages="uuid zod"></app-add-dependency>   (self-closing also accepted)
//! ```
//!
//! Everything else in the response is ignored.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;

use crate::core::types::EditDirective;

static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)<app-write\s+path="(?P<wpath>[^"]+)"\s*>(?P<content>.*?)</app-write>|<app-delete\s+path="(?P<dpath>[^"]+)"\s*(?:/>|>\s*</app-delete>)|<app-add-dependency\s+packages="(?P<packages>[^"]*)"\s*(?:/>|>\s*</app-add-dependency>)"#,
    )
    .unwrap()
});

/// Extract directives in the order they appear.
pub fn parse_directives(response: &str) -> Vec<EditDirective> {
    DIRECTIVE_RE
        .captures_iter(response)
        .filter_map(|caps| {
            if let Some(path) = caps.name("wpath") {
                let content = caps.name("content").map_or("", |m| m.as_str());
                return Some(EditDirective::Write {
                    path: path.as_str().trim().to_string(),
                    content: strip_fence(content),
                });
            }
            if let Some(path) = caps.name("dpath") {
                return Some(EditDirective::Delete {
                    path: path.as_str().trim().to_string(),
                });
            }
            let packages: Vec<String> = caps
                .name("packages")?
                .as_str()
                .split_whitespace()
                .map(str::to_string)
                .collect();
            (!packages.is_empty()).then_some(EditDirective::AddDependency { packages })
        })
        .collect()
}

/// Agents often wrap file bodies in a markdown fence; keep only the body.
fn strip_fence(content: &str) -> String {
    let trimmed = content.trim_matches('\n');
    let Some(rest) = trimmed.strip_prefix("```") else {
        return ensure_trailing_newline(trimmed);
    };
    let Some((_, body)) = rest.split_once('\n') else {
        return ensure_trailing_newline(trimmed);
    };
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    ensure_trailing_newline(body.trim_end_matches('\n'))
}

fn ensure_trailing_newline(body: &str) -> String {
    if body.is_empty() {
        return String::new();
    }
    let mut out = body.to_string();
    out.push('\n');
    out
}

/// Resolve a directive path inside `root`, rejecting anything that could escape it.
pub fn resolve_in_root(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel.trim().is_empty() {
        return Err(anyhow!("empty path"));
    }
    let mut clean = PathBuf::new();
    for component in rel_path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("path '{rel}' escapes the project root"));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(anyhow!("path '{rel}' names the project root"));
    }
    Ok(root.join(clean))
}
