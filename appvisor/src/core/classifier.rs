//! Deterministic classification of dev-server output into an [`ErrorReport`].
//!
//! Matching is heuristic. The matcher set is an ordered list: the first matcher that
//! accepts a line decides its [`BuildError`], and a line nothing accepts is simply not an
//! error. Extra matchers from configuration are tried before the built-in ones.

use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::{BuildError, ErrorReport, OutputRecord, OutputStream, RuntimeErrorEvent};

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .unwrap()
});

/// `file:line[:column]: [error [CODE]:] message` (vite, esbuild, eslint, tsc --pretty).
const COLON_LOCATED: &str = r#"^\s*(?P<file>[^\s:()'"]*[./][^\s:()'"]*):(?P<line>\d+)(?::(?P<column>\d+))?(?::|\s+-|\s)\s*(?:(?i:error)(?:\s+(?P<code>[A-Z]+\d+))?\s*:\s*)?(?P<message>\S.*)$"#;

/// `file(line,column): error CODE: message` (tsc).
const PAREN_LOCATED: &str = r#"^\s*(?P<file>[^\s()'"]+\.[A-Za-z0-9]+)\((?P<line>\d+),(?P<column>\d+)\)\s*:\s*(?:(?i:error)(?:\s+(?P<code>[A-Z]+\d+))?\s*:\s*)?(?P<message>\S.*)$"#;

const FATAL_KEYWORDS: &[(&str, &str)] = &[
    (
        "module-not-found",
        r"(?i)\b(cannot find module|module not found|could not resolve)\b",
    ),
    ("failed-to-compile", r"(?i)\bfailed to compile\b"),
    ("syntax-error", r"\bSyntaxError\b"),
    ("address-in-use", r"\bEADDRINUSE\b"),
    (
        "command-not-found",
        r"(?i)command not found|is not recognized as an internal or external command",
    ),
    ("pnpm-error", r"\bERR_PNPM_[A-Z_]+\b"),
];

/// A user-supplied matcher, as written in the `[classifier]` config table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatternConfig {
    /// Identifier recorded as the error `code` for unlocated matches.
    pub name: String,
    /// Regex. Located patterns must define `file`, `line` and `message` groups
    /// (`column` and `code` are optional).
    pub pattern: String,
    #[serde(default)]
    pub located: bool,
}

#[derive(Debug, Clone)]
struct Matcher {
    name: String,
    regex: Regex,
    located: bool,
}

impl Matcher {
    fn new(name: &str, pattern: &str, located: bool) -> Result<Self> {
        let regex =
            Regex::new(pattern).with_context(|| format!("compile error pattern '{name}'"))?;
        if located {
            for group in ["file", "line", "message"] {
                if !regex.capture_names().flatten().any(|n| n == group) {
                    return Err(anyhow!(
                        "located pattern '{name}' is missing the '{group}' capture group"
                    ));
                }
            }
        }
        Ok(Self {
            name: name.to_string(),
            regex,
            located,
        })
    }

    fn apply(&self, line: &str) -> Option<BuildError> {
        let caps = self.regex.captures(line)?;
        if !self.located {
            return Some(BuildError {
                file: None,
                line: None,
                column: None,
                message: line.trim().to_string(),
                code: Some(self.name.clone()),
            });
        }
        let message = caps.name("message")?.as_str().trim();
        if message.is_empty() {
            return None;
        }
        Some(BuildError {
            file: caps.name("file").map(|m| m.as_str().to_string()),
            line: caps.name("line").and_then(|m| m.as_str().parse().ok()),
            column: caps.name("column").and_then(|m| m.as_str().parse().ok()),
            message: message.to_string(),
            code: caps.name("code").map(|m| m.as_str().to_string()),
        })
    }
}

/// Ordered, extensible set of output matchers.
#[derive(Debug, Clone)]
pub struct Classifier {
    matchers: Vec<Matcher>,
    scan_stdout: bool,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(&[], false).unwrap_or_else(|_| Self {
            matchers: Vec::new(),
            scan_stdout: false,
        })
    }
}

impl Classifier {
    pub fn new(extra: &[PatternConfig], scan_stdout: bool) -> Result<Self> {
        let mut matchers = Vec::with_capacity(extra.len() + FATAL_KEYWORDS.len() + 2);
        for pattern in extra {
            matchers.push(Matcher::new(
                &pattern.name,
                &pattern.pattern,
                pattern.located,
            )?);
        }
        matchers.push(Matcher::new("colon-location", COLON_LOCATED, true)?);
        matchers.push(Matcher::new("paren-location", PAREN_LOCATED, true)?);
        for (name, pattern) in FATAL_KEYWORDS {
            matchers.push(Matcher::new(name, pattern, false)?);
        }
        Ok(Self {
            matchers,
            scan_stdout,
        })
    }

    /// Classify a single line; `None` means "no error detected".
    pub fn classify_line(&self, line: &str) -> Option<BuildError> {
        let clean = strip_ansi(line);
        if clean.trim().is_empty() {
            return None;
        }
        self.matchers.iter().find_map(|m| m.apply(&clean))
    }

    fn scans(&self, record: &OutputRecord) -> bool {
        record.stream == OutputStream::Stderr || self.scan_stdout
    }

    /// Build a report from output records and externally reported runtime errors.
    ///
    /// Identical inputs give identical `build_errors`/`runtime_errors`, in first-seen order.
    /// Build errors collapse on `(file, line, message)`; runtime errors on
    /// `(kind, message, file)`.
    pub fn create_error_report<'a, O, R>(&self, outputs: O, runtime_errors: R) -> ErrorReport
    where
        O: IntoIterator<Item = &'a OutputRecord>,
        R: IntoIterator<Item = &'a RuntimeErrorEvent>,
    {
        let mut seen_build = HashSet::new();
        let mut build_errors = Vec::new();
        for record in outputs {
            if !self.scans(record) {
                continue;
            }
            for line in record.message.lines() {
                let Some(err) = self.classify_line(line) else {
                    continue;
                };
                let key = (err.file.clone(), err.line, err.message.clone());
                if seen_build.insert(key) {
                    build_errors.push(err);
                }
            }
        }

        let mut seen_runtime = HashSet::new();
        let mut runtime = Vec::new();
        for event in runtime_errors {
            let key = (event.kind.clone(), event.message.clone(), event.file.clone());
            if seen_runtime.insert(key) {
                runtime.push(event.clone());
            }
        }

        ErrorReport {
            has_errors: !build_errors.is_empty() || !runtime.is_empty(),
            build_errors,
            runtime_errors: runtime,
            generated_at: Utc::now(),
        }
    }
}

/// Remove terminal escape sequences and carriage returns.
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").replace('\r', "")
}
