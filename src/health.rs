//! Database readiness gate
//!
//! The deployment this replaces held the application back until Postgres
//! answered a polling healthcheck. Here the probe runs in-process: the
//! listener does not start accepting traffic until the database has passed
//! `success_threshold` consecutive TCP probes, spaced `interval` apart,
//! after an initial `start_period` grace window. Readiness is published on a
//! watch channel and probing continues passively afterwards.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Readiness probe configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Grace period before the first probe
    pub start_period: Duration,
    /// Interval between probes
    pub interval: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
    /// Number of consecutive successes before reporting ready
    pub success_threshold: u32,
    /// Number of consecutive failures before revoking readiness
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            start_period: Duration::from_secs(6),
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(3),
            success_threshold: 3,
            failure_threshold: 3,
        }
    }
}

/// Tracks consecutive probe results
#[derive(Debug, Default)]
struct ProbeState {
    consecutive_successes: u32,
    consecutive_failures: u32,
    is_ready: bool,
}

impl ProbeState {
    /// Record one probe result; returns the new readiness value when the
    /// state transitions.
    fn observe(&mut self, ok: bool, config: &HealthCheckConfig) -> Option<bool> {
        if ok {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            if !self.is_ready && self.consecutive_successes >= config.success_threshold {
                self.is_ready = true;
                return Some(true);
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            if self.is_ready && self.consecutive_failures >= config.failure_threshold {
                self.is_ready = false;
                return Some(false);
            }
        }
        None
    }
}

/// Readiness probe for the database
pub struct DbHealthcheck {
    addr: String,
    config: HealthCheckConfig,
    ready_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DbHealthcheck {
    /// Create the probe along with the receiver half of its readiness flag
    pub fn new(
        addr: String,
        config: HealthCheckConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Self, watch::Receiver<bool>) {
        let (ready_tx, ready_rx) = watch::channel(false);
        (
            Self {
                addr,
                config,
                ready_tx,
                shutdown_rx,
            },
            ready_rx,
        )
    }

    pub async fn run(mut self) {
        info!(
            addr = %self.addr,
            start_period_secs = self.config.start_period.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            success_threshold = self.config.success_threshold,
            "Database readiness probe started"
        );

        // grace period before the first probe
        tokio::select! {
            _ = tokio::time::sleep(self.config.start_period) => {}
            _ = self.shutdown_rx.changed() => {
                if *self.shutdown_rx.borrow() {
                    return;
                }
            }
        }

        let mut state = ProbeState::default();

        loop {
            let ok = probe_once(&self.addr, self.config.timeout).await;
            match state.observe(ok, &self.config) {
                Some(true) => {
                    info!(
                        addr = %self.addr,
                        probes = state.consecutive_successes,
                        "Database is ready"
                    );
                    let _ = self.ready_tx.send(true);
                }
                Some(false) => {
                    warn!(
                        addr = %self.addr,
                        failures = state.consecutive_failures,
                        "Database is no longer reachable"
                    );
                    let _ = self.ready_tx.send(false);
                }
                None => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Database readiness probe shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// One probe: a TCP connect within the timeout, the `pg_isready` equivalent
async fn probe_once(addr: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => {
            debug!(addr, "Probe passed (TCP connect)");
            true
        }
        Ok(Err(e)) => {
            debug!(addr, error = %e, "Probe failed (connection error)");
            false
        }
        Err(_) => {
            debug!(addr, "Probe failed (timeout)");
            false
        }
    }
}

/// Derive the host:port to probe from the administrative connection URL
pub fn probe_addr(admin_url: &str) -> anyhow::Result<String> {
    let config: tokio_postgres::Config = admin_url
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid administrative database URL: {}", e))?;

    let host = config
        .get_hosts()
        .iter()
        .find_map(|host| match host {
            tokio_postgres::config::Host::Tcp(h) => Some(h.clone()),
            _ => None,
        })
        .ok_or_else(|| anyhow::anyhow!("administrative database URL has no TCP host"))?;

    let port = config.get_ports().first().copied().unwrap_or(5432);

    Ok(format!("{}:{}", host, port))
}

/// Block startup until the readiness flag goes up, bounded by a deadline
pub async fn wait_ready(
    mut ready_rx: watch::Receiver<bool>,
    deadline: Duration,
) -> anyhow::Result<()> {
    let wait = async {
        loop {
            if *ready_rx.borrow_and_update() {
                return Ok(());
            }
            ready_rx.changed().await.map_err(|_| {
                anyhow::anyhow!("readiness probe stopped before the database became ready")
            })?;
        }
    };

    match tokio::time::timeout(deadline, wait).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!(
            "database not ready within {} seconds",
            deadline.as_secs()
        ),
    }
}
