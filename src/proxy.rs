//! The gateway listener and request dispatch
//!
//! A single HTTP/1.1 listener routes every request through the routing table
//! to a static file, the upstream, or a redirect. Requests are handled
//! independently; there is no shared mutable routing state.

use crate::error::{json_error_response, GatewayErrorCode, ResponseBody};
use crate::router::{RouteAction, RouteMatcher, RouteRule, RouteTable};
use crate::static_files;
use crate::upstream::UpstreamClient;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Listener settings beyond the routing table
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Keep-alive idle timeout (bound on waiting for the next request head)
    pub keepalive_timeout: Duration,
    /// Maximum declared request body size
    pub max_body_bytes: u64,
    /// Maximum simultaneous connections; excess queues in the accept backlog
    pub max_connections: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            keepalive_timeout: Duration::from_secs(65),
            max_body_bytes: 4 * 1024 * 1024 * 1024,
            max_connections: 1024,
        }
    }
}

/// State shared by every connection
struct Shared {
    routes: Arc<RouteTable>,
    static_root: PathBuf,
    upstream: Arc<UpstreamClient>,
    max_body_bytes: u64,
}

/// The gateway server
pub struct ProxyServer {
    listener: TcpListener,
    routes: Arc<RouteTable>,
    static_root: PathBuf,
    upstream: Arc<UpstreamClient>,
    settings: ProxySettings,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listener. Binding is separate from [`run`](Self::run) so the
    /// effective address is known before traffic is accepted.
    pub async fn bind(
        bind_addr: SocketAddr,
        routes: Arc<RouteTable>,
        static_root: PathBuf,
        upstream: Arc<UpstreamClient>,
        settings: ProxySettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            routes,
            static_root,
            upstream,
            settings,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            addr = %self.listener.local_addr()?,
            upstream = %self.upstream.authority(),
            max_connections = self.settings.max_connections,
            keepalive_timeout_secs = self.settings.keepalive_timeout.as_secs(),
            "Gateway listening (HTTP/1.1)"
        );

        let limiter = Arc::new(Semaphore::new(self.settings.max_connections));
        let shared = Arc::new(Shared {
            routes: Arc::clone(&self.routes),
            static_root: self.static_root.clone(),
            upstream: Arc::clone(&self.upstream),
            max_body_bytes: self.settings.max_body_bytes,
        });
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            // Take the permit before accepting so that connections beyond
            // capacity wait in the OS accept backlog.
            let permit = tokio::select! {
                permit = Arc::clone(&limiter).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                    continue;
                }
            };

            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let shared = Arc::clone(&shared);
                            let keepalive = self.settings.keepalive_timeout;

                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, addr, shared, keepalive).await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    keepalive: Duration,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        async move { handle_request(req, shared, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(keepalive)
        .preserve_header_case(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    shared: Arc<Shared>,
    client_addr: SocketAddr,
) -> Result<Response<ResponseBody>, hyper::Error> {
    let started = Instant::now();

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if let Some(length) = declared_content_length(&req) {
        if length > shared.max_body_bytes {
            let response = json_error_response(
                GatewayErrorCode::PayloadTooLarge,
                format!(
                    "Declared body of {} bytes exceeds the {} byte limit",
                    length, shared.max_body_bytes
                ),
            );
            log_access(&method, &path, response.status(), started, &request_id);
            return Ok(response);
        }
    }

    let response = match shared.routes.matched(&path) {
        Some(rule) => dispatch(req, rule, &shared, client_addr, &request_id).await,
        None => json_error_response(
            GatewayErrorCode::NotFound,
            format!("No route for {}", path),
        ),
    };

    log_access(&method, &path, response.status(), started, &request_id);
    Ok(response)
}

async fn dispatch(
    req: Request<Incoming>,
    rule: &RouteRule,
    shared: &Arc<Shared>,
    client_addr: SocketAddr,
    request_id: &str,
) -> Response<ResponseBody> {
    match &rule.action {
        RouteAction::File(name) => match static_files::serve(&shared.static_root, name).await {
            Some(response) => response,
            None => json_error_response(
                GatewayErrorCode::NotFound,
                format!("No such file: {}", name),
            ),
        },
        RouteAction::Static { strip_prefix } => {
            let path = req.uri().path();
            let lookup = if *strip_prefix {
                match &rule.matcher {
                    RouteMatcher::Prefix(prefix) => {
                        path.strip_prefix(prefix.as_str()).unwrap_or(path)
                    }
                    RouteMatcher::Exact(_) => path,
                }
            } else {
                path
            };

            match static_files::serve(&shared.static_root, lookup).await {
                Some(response) => response,
                None => json_error_response(
                    GatewayErrorCode::NotFound,
                    format!("No such file: {}", path),
                ),
            }
        }
        RouteAction::StaticOrUpstream => {
            // Fallback chain: the full request path as a file under the
            // root, otherwise the upstream.
            let path = req.uri().path().to_string();
            match static_files::serve(&shared.static_root, &path).await {
                Some(response) => response,
                None => forward(req, shared, client_addr, request_id).await,
            }
        }
        RouteAction::Redirect { status } => build_root_redirect(&req, *status),
    }
}

async fn forward(
    mut req: Request<Incoming>,
    shared: &Arc<Shared>,
    client_addr: SocketAddr,
    request_id: &str,
) -> Response<ResponseBody> {
    // Security: X-Forwarded-* headers are overwritten rather than appended to
    // prevent client spoofing. This gateway is the first trusted hop. The
    // Host header stays as the client sent it.
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(
        method = %req.method(),
        uri = %req.uri(),
        request_id,
        "Forwarding request upstream"
    );

    let request_timeout = shared.upstream.config().request_timeout;
    let result = tokio::time::timeout(request_timeout, shared.upstream.send_request(req)).await;

    match result {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            // No cooldown for the single upstream: the failure is surfaced
            // and the next request dials again immediately.
            error!(
                upstream = %shared.upstream.authority(),
                error = %e,
                "Failed to forward request"
            );
            json_error_response(
                GatewayErrorCode::UpstreamUnreachable,
                "Failed to connect to upstream",
            )
        }
        Err(_) => {
            warn!(
                upstream = %shared.upstream.authority(),
                timeout_secs = request_timeout.as_secs(),
                "Upstream request timed out"
            );
            json_error_response(
                GatewayErrorCode::UpstreamTimeout,
                format!(
                    "Upstream did not respond within {} seconds",
                    request_timeout.as_secs()
                ),
            )
        }
    }
}

/// Build a redirect to the scheme+host root, discarding the request path
fn build_root_redirect<B>(req: &Request<B>, status: u16) -> Response<ResponseBody> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");

    let location = format!("http://{}/", host);
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::MOVED_PERMANENTLY);

    Response::builder()
        .status(status)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Redirecting to site root"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

fn declared_content_length<B>(req: &Request<B>) -> Option<u64> {
    req.headers()
        .get(hyper::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn log_access(method: &Method, path: &str, status: StatusCode, started: Instant, request_id: &str) {
    info!(
        target: "access",
        method = %method,
        path,
        status = status.as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        request_id,
        "request"
    );
}
