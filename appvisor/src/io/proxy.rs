//! Reverse proxy worker: a stable local address in front of an app's dev server.
//!
//! Each proxy runs on its own OS thread with its own single-threaded tokio runtime and talks
//! to its owner only through [`ProxyMessage`]s. A panic or serve error inside the worker is
//! reported as a message; it never unwinds into the supervisor.
//!
//! Requests are forwarded with `Host`/`Origin`/`Referer` pointed at the dev server, and
//! responses have absolute links to the dev server's origin rewritten to the proxy's, so the
//! preview's same-origin checks see one stable address. Bodies are buffered; WebSocket
//! upgrades (HMR) are not tunnelled and keep talking to the dev server directly.

use std::any::Any;
use std::net::Ipv4Addr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use reqwest::Url;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use crate::core::ready::{parse_proxy_ready, proxy_ready_message};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::io::ports;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const START_TIMEOUT: Duration = Duration::from_secs(10);

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// First port to probe; allocation wraps around the range from here.
    pub first_port: Option<u16>,
    pub ready_marker: String,
    pub request_timeout: Duration,
}

/// Messages a proxy worker sends to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyMessage {
    /// Sent once after the listener is bound: `"<marker> url=<proxyUrl>"`.
    Ready(String),
    /// The worker could not start.
    Failed(String),
    /// The worker stopped after being ready; `Some` carries the failure.
    Exited(Option<String>),
}

/// Owner's handle to a running proxy worker. Dropping it shuts the worker down.
#[derive(Debug)]
pub struct ProxyHandle {
    pub port: u16,
    pub proxy_url: String,
    pub target_origin: String,
    shutdown: Option<oneshot::Sender<()>>,
    messages: Option<mpsc::UnboundedReceiver<ProxyMessage>>,
}

impl ProxyHandle {
    /// Receiver for the worker's later messages (its exit). Can be taken once.
    pub fn take_messages(&mut self) -> Option<mpsc::UnboundedReceiver<ProxyMessage>> {
        self.messages.take()
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
            debug!(proxy_url = %self.proxy_url, "proxy shutdown requested");
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Validate a dev-server address and reduce it to `scheme://host[:port]`.
pub fn normalize_origin(target: &str) -> OrchestratorResult<String> {
    let url = Url::parse(target.trim())
        .map_err(|e| OrchestratorError::InvalidTarget(format!("{target}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(OrchestratorError::InvalidTarget(format!(
            "{target}: scheme must be http or https"
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| OrchestratorError::InvalidTarget(format!("{target}: missing host")))?;
    Ok(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

/// Start a proxy worker for `target` and wait for its readiness message.
#[instrument(skip_all, fields(target = %target))]
pub async fn start(target: &str, options: &ProxyOptions) -> OrchestratorResult<ProxyHandle> {
    let target_origin = normalize_origin(target)?;
    let port = ports::allocate_from(
        options.port_range_start,
        options.port_range_end,
        options.first_port.unwrap_or(options.port_range_start),
    )?;

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let worker = Worker {
        port,
        target_origin: target_origin.clone(),
        marker: options.ready_marker.clone(),
        request_timeout: options.request_timeout,
    };

    thread::Builder::new()
        .name(format!("appvisor-proxy-{port}"))
        .spawn(move || worker.run(msg_tx, shutdown_rx))
        .map_err(|e| OrchestratorError::ProxyBindFailed(format!("spawn proxy thread: {e}")))?;

    let first = tokio::time::timeout(START_TIMEOUT, msg_rx.recv())
        .await
        .map_err(|_| OrchestratorError::ProxyBindFailed("proxy did not report readiness".into()))?;
    match first {
        Some(ProxyMessage::Ready(text)) => {
            let proxy_url = parse_proxy_ready(&options.ready_marker, &text).ok_or_else(|| {
                OrchestratorError::ProxyBindFailed(format!("malformed readiness message: {text}"))
            })?;
            info!(%proxy_url, %target_origin, "proxy ready");
            Ok(ProxyHandle {
                port,
                proxy_url,
                target_origin,
                shutdown: Some(shutdown_tx),
                messages: Some(msg_rx),
            })
        }
        Some(ProxyMessage::Failed(reason)) | Some(ProxyMessage::Exited(Some(reason))) => {
            Err(OrchestratorError::ProxyBindFailed(reason))
        }
        Some(ProxyMessage::Exited(None)) | None => Err(OrchestratorError::ProxyBindFailed(
            "proxy worker exited before binding".into(),
        )),
    }
}

struct Worker {
    port: u16,
    target_origin: String,
    marker: String,
    request_timeout: Duration,
}

impl Worker {
    fn run(self, tx: mpsc::UnboundedSender<ProxyMessage>, shutdown: oneshot::Receiver<()>) {
        let port = self.port;
        let report = tx.clone();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("build proxy runtime")?;
            runtime.block_on(self.serve(tx, shutdown))
        }));
        let exit = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(panic) => Some(format!("proxy worker panicked: {}", panic_text(&*panic))),
        };
        match &exit {
            Some(reason) => error!(port, %reason, "proxy worker stopped"),
            None => debug!(port, "proxy worker stopped"),
        }
        let _ = report.send(ProxyMessage::Exited(exit));
    }

    async fn serve(
        self,
        tx: mpsc::UnboundedSender<ProxyMessage>,
        shutdown: oneshot::Receiver<()>,
    ) -> Result<()> {
        let listener = match tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, self.port)).await
        {
            Ok(listener) => listener,
            Err(e) => {
                let reason = format!("bind 127.0.0.1:{}: {e}", self.port);
                let _ = tx.send(ProxyMessage::Failed(reason.clone()));
                return Err(anyhow!(reason));
            }
        };
        let proxy_url = format!("http://localhost:{}", self.port);

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .timeout(self.request_timeout)
            .build()
            .context("build proxy client")?;
        let state = Arc::new(ProxyState::new(client, &self.target_origin, &proxy_url)?);
        let app = Router::new().fallback(forward).with_state(state);

        let _ = tx.send(ProxyMessage::Ready(proxy_ready_message(
            &self.marker,
            &proxy_url,
        )));

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.await;
            })
            .await
            .context("serve proxy")
    }
}

fn panic_text(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}

#[derive(Debug)]
struct ProxyState {
    client: reqwest::Client,
    target_origin: String,
    /// `host:port` of the dev server, used for the forwarded `Host` header.
    target_authority: String,
    /// Spellings of the target origin that pages may embed.
    target_aliases: Vec<String>,
    proxy_url: String,
}

impl ProxyState {
    fn new(client: reqwest::Client, target_origin: &str, proxy_url: &str) -> Result<Self> {
        let target_authority = target_origin
            .split_once("://")
            .map(|(_, rest)| rest.to_string())
            .ok_or_else(|| anyhow!("target origin {target_origin} has no scheme"))?;
        Ok(Self {
            client,
            target_origin: target_origin.to_string(),
            target_authority,
            target_aliases: origin_aliases(target_origin),
            proxy_url: proxy_url.to_string(),
        })
    }
}

/// The origin plus its loopback spellings (`localhost` ↔ `127.0.0.1`).
fn origin_aliases(origin: &str) -> Vec<String> {
    let mut aliases = vec![origin.to_string()];
    for (from, to) in [("localhost", "127.0.0.1"), ("127.0.0.1", "localhost")] {
        if origin.contains(&format!("//{from}")) {
            aliases.push(origin.replacen(&format!("//{from}"), &format!("//{to}"), 1));
        }
    }
    aliases
}

async fn forward(State(state): State<Arc<ProxyState>>, req: Request) -> Response<Body> {
    match forward_inner(&state, req).await {
        Ok(response) => response,
        Err(err) => {
            warn!(err = %format!("{err:#}"), target = %state.target_origin, "proxy request failed");
            (
                StatusCode::BAD_GATEWAY,
                format!("appvisor proxy could not reach {}: {err:#}", state.target_origin),
            )
                .into_response()
        }
    }
}

async fn forward_inner(state: &ProxyState, req: Request) -> Result<Response<Body>> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
    let url = format!("{}{}", state.target_origin, path_and_query);
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .context("read request body")?;

    debug!(method = %parts.method, %url, "forwarding request");
    let upstream = state
        .client
        .request(parts.method.clone(), &url)
        .headers(rewrite_request_headers(&parts.headers, state))
        .body(body)
        .send()
        .await
        .with_context(|| format!("forward {} {url}", parts.method))?;

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let bytes = upstream.bytes().await.context("read upstream body")?;
    let (headers, body) = rewrite_response(&upstream_headers, bytes, state);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn rewrite_request_headers(incoming: &HeaderMap, state: &ProxyState) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len());
    for (name, value) in incoming {
        if is_hop_by_hop(name)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            // Upstream bodies must arrive uncompressed so links can be rewritten.
            || name == header::ACCEPT_ENCODING
        {
            continue;
        }
        let value = if name == header::ORIGIN || name == header::REFERER {
            replace_header(value, std::slice::from_ref(&state.proxy_url), &state.target_origin)
        } else {
            value.clone()
        };
        headers.append(name.clone(), value);
    }
    if let Ok(host) = HeaderValue::from_str(&state.target_authority) {
        headers.insert(header::HOST, host);
    }
    headers
}

fn rewrite_response(upstream: &HeaderMap, body: Bytes, state: &ProxyState) -> (HeaderMap, Bytes) {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        let value = if name == header::LOCATION
            || name == header::ACCESS_CONTROL_ALLOW_ORIGIN
            || name == header::CONTENT_LOCATION
        {
            replace_header(value, &state.target_aliases, &state.proxy_url)
        } else {
            value.clone()
        };
        headers.append(name.clone(), value);
    }

    let rewritable = upstream
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(is_textual)
        && upstream.get(header::CONTENT_ENCODING).is_none();
    if !rewritable {
        return (headers, body);
    }
    match std::str::from_utf8(&body) {
        Ok(text) => {
            let rewritten = rewrite_links(text, &state.target_aliases, &state.proxy_url);
            (headers, Bytes::from(rewritten))
        }
        Err(_) => (headers, body),
    }
}

fn replace_header(value: &HeaderValue, from: &[String], to: &str) -> HeaderValue {
    let Ok(text) = value.to_str() else {
        return value.clone();
    };
    let rewritten = rewrite_links(text, from, to);
    HeaderValue::from_str(&rewritten).unwrap_or_else(|_| value.clone())
}

/// Replace every occurrence of any origin in `from` with `to`.
///
/// An occurrence only counts when the origin ends there, so `http://localhost:5173` leaves
/// `http://localhost:51730` and `http://localhost:5173.example` alone.
pub fn rewrite_links(text: &str, from: &[String], to: &str) -> String {
    let mut out = text.to_string();
    for origin in from {
        if origin != to && out.contains(origin.as_str()) {
            out = replace_origin(&out, origin, to);
        }
    }
    out
}

fn replace_origin(text: &str, origin: &str, to: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    for (start, _) in text.match_indices(origin) {
        let end = start + origin.len();
        let continues = text[end..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if continues {
            continue;
        }
        out.push_str(&text[copied..start]);
        out.push_str(to);
        copied = end;
    }
    out.push_str(&text[copied..]);
    out
}

fn is_textual(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("text/")
        || ["javascript", "json", "xml", "svg", "x-www-form-urlencoded"]
            .iter()
            .any(|kind| ct.contains(kind))
}
