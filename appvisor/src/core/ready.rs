//! Sentinel-line parsing: dev-server readiness and the proxy's started marker.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::core::classifier::strip_ansi;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[A-Za-z0-9.\-_\[\]:]+(?::\d+)?").unwrap());

static HOST_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]|[A-Za-z0-9\-]+\.local):(\d{2,5})\b")
        .unwrap()
});

/// Default readiness patterns (Next.js, Vite, CRA/webpack, Astro, generic "listening on").
pub fn default_ready_patterns() -> Vec<String> {
    [
        r"(?i)\bready\b.*\b(on|in|at)\b",
        r"(?i)\bLocal:\s+https?://",
        r"(?i)\blistening on\b",
        r"(?i)\bserver (is )?running at\b",
        r"(?i)compiled successfully",
    ]
    .iter()
    .map(|p| (*p).to_string())
    .collect()
}

/// Compiled "server ready" sentinel matcher.
#[derive(Debug, Clone)]
pub struct ReadyDetector {
    patterns: Vec<Regex>,
}

impl ReadyDetector {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("compile ready pattern '{p}'")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Return the dev server's origin if `line` is a readiness line carrying an address.
    ///
    /// A sentinel without an address (e.g. "compiled successfully") is not enough on its own.
    pub fn detect(&self, line: &str) -> Option<String> {
        let clean = strip_ansi(line);
        if !self.patterns.iter().any(|re| re.is_match(&clean)) {
            return None;
        }
        extract_origin(&clean)
    }
}

/// Extract `scheme://host:port` from free text, normalizing wildcard hosts to `localhost`.
pub fn extract_origin(text: &str) -> Option<String> {
    if let Some(m) = URL_RE.find(text) {
        let url = m.as_str().trim_end_matches(['/', '.', ',']);
        let (scheme, rest) = url.split_once("://")?;
        return Some(format!("{scheme}://{}", normalize_host(rest)));
    }
    let caps = HOST_PORT_RE.captures(text)?;
    let host = caps.get(1)?.as_str();
    let port = caps.get(2)?.as_str();
    Some(format!("http://{}", normalize_host(&format!("{host}:{port}"))))
}

fn normalize_host(authority: &str) -> String {
    for wildcard in ["0.0.0.0", "[::]"] {
        if let Some(port) = authority.strip_prefix(wildcard) {
            return format!("localhost{port}");
        }
    }
    authority.to_string()
}

/// Render the proxy worker's single readiness message.
pub fn proxy_ready_message(marker: &str, proxy_url: &str) -> String {
    format!("{marker} url={proxy_url}")
}

/// Parse a message produced by [`proxy_ready_message`].
pub fn parse_proxy_ready(marker: &str, message: &str) -> Option<String> {
    let rest = message.trim().strip_prefix(marker)?;
    let url = rest.trim().strip_prefix("url=")?;
    let url = url.split_whitespace().next()?;
    (!url.is_empty()).then(|| url.to_string())
}
