//! Pooled HTTP client for the single upstream backend
//!
//! Connections are pooled for reuse, but upstream failures carry no state:
//! a failed request is surfaced to the caller and the next request dials
//! again immediately. With exactly one upstream replica there is nothing to
//! fail over to, so immediate retry beats a cooldown window.

use crate::error::{BodyError, ResponseBody};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for upstream requests
#[derive(Debug)]
pub enum UpstreamError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Client(e) => write!(f, "Client error: {}", e),
            UpstreamError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<hyper_util::client::legacy::Error> for UpstreamError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        UpstreamError::Client(err)
    }
}

/// Statistics for the upstream client
#[derive(Debug, Default)]
pub struct UpstreamStats {
    /// Total number of requests forwarded upstream
    pub total_requests: AtomicU64,
    /// Number of forwarded requests that failed
    pub failed_requests: AtomicU64,
}

impl UpstreamStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the upstream client
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Upstream authority, host:port
    pub addr: String,
    /// Maximum idle connections kept to the upstream
    pub max_idle: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Maximum time to wait for an upstream response
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            max_idle: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// A pooled HTTP client bound to the single upstream backend
pub struct UpstreamClient {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<UpstreamStats>,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            addr = %config.addr,
            max_idle = config.max_idle,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream client initialized"
        );

        Self {
            client,
            stats: Arc::new(UpstreamStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn authority(&self) -> &str {
        &self.config.addr
    }

    pub fn stats(&self) -> Arc<UpstreamStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to the upstream, rewriting only the URI authority.
    /// Method, headers (including Host), query string, and body pass through
    /// unchanged.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ResponseBody>, UpstreamError> {
        let uri = format!(
            "http://{}{}",
            self.config.addr,
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = match self.client.request(upstream_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(
            parts,
            body.map_err(|e| Box::new(e) as BodyError).boxed(),
        ))
    }
}
