use roost::bootstrap::{self, BootstrapSpec};
use roost::config::Config;
use roost::health::{self, DbHealthcheck, HealthCheckConfig};
use roost::proxy::{ProxyServer, ProxySettings};
use roost::upstream::{UpstreamClient, UpstreamConfig};
use roost::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("roost=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("roost.toml"));

    let config = if config_path.exists() {
        Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?
    } else {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    };

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Provision the database and gate on its readiness before any traffic
    if config.database.enabled {
        let admin_url = config.database.admin_url()?;

        let spec = BootstrapSpec {
            role: config.database.role.clone(),
            password: config.database.password()?,
            database: config.database.database.clone(),
            extensions: config.database.extensions.clone(),
        };

        let outcome = bootstrap::run(&admin_url, &spec).await?;
        if outcome.is_noop() {
            info!(
                role = %spec.role,
                database = %spec.database,
                "Database already provisioned"
            );
        } else {
            info!(
                role_created = outcome.role_created,
                database_created = outcome.database_created,
                extensions = ?outcome.extensions_created,
                "Database provisioned"
            );
        }

        if config.healthcheck.enabled {
            let probe_addr = health::probe_addr(&admin_url)?;
            let health_config = HealthCheckConfig {
                start_period: Duration::from_secs(config.healthcheck.start_period_secs),
                interval: Duration::from_secs(config.healthcheck.interval_secs),
                timeout: Duration::from_secs(config.healthcheck.timeout_secs),
                success_threshold: config.healthcheck.success_threshold,
                failure_threshold: config.healthcheck.failure_threshold,
            };

            let (checker, ready_rx) =
                DbHealthcheck::new(probe_addr, health_config, shutdown_rx.clone());
            tokio::spawn(checker.run());

            info!("Waiting for database readiness before accepting traffic");
            let deadline = Duration::from_secs(config.healthcheck.startup_deadline_secs);
            health::wait_ready(ready_rx, deadline).await?;
        }
    }

    // Build the gateway
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let routes = Arc::new(config.route_table()?);

    let upstream = Arc::new(UpstreamClient::new(UpstreamConfig {
        addr: config.upstream.addr.clone(),
        max_idle: config.upstream.pool_max_idle,
        idle_timeout: Duration::from_secs(config.upstream.pool_idle_timeout_secs),
        request_timeout: Duration::from_secs(config.upstream.request_timeout_secs),
    }));
    let upstream_stats = upstream.stats();

    let settings = ProxySettings {
        keepalive_timeout: Duration::from_secs(config.server.keepalive_timeout_secs),
        max_body_bytes: config.server.max_body_bytes,
        max_connections: config.server.max_connections,
    };

    let server = ProxyServer::bind(
        bind_addr,
        routes,
        PathBuf::from(&config.static_files.root),
        upstream,
        settings,
        shutdown_rx.clone(),
    )
    .await?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and wait for the listener to stop (with timeout)
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!(
        forwarded = upstream_stats.get_total_requests(),
        failed = upstream_stats.get_failed_requests(),
        "Upstream request totals"
    );
    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        keepalive_timeout_secs = config.server.keepalive_timeout_secs,
        max_body_bytes = config.server.max_body_bytes,
        max_connections = config.server.max_connections,
        "Server configuration"
    );
    info!(
        addr = %config.upstream.addr,
        pool_max_idle = config.upstream.pool_max_idle,
        pool_idle_timeout_secs = config.upstream.pool_idle_timeout_secs,
        request_timeout_secs = config.upstream.request_timeout_secs,
        "Upstream settings"
    );
    info!(root = %config.static_files.root, "Static root");
    info!(
        enabled = config.database.enabled,
        role = %config.database.role,
        database = %config.database.database,
        extensions = ?config.database.extensions,
        "Database provisioning settings"
    );
    info!(
        enabled = config.healthcheck.enabled,
        start_period_secs = config.healthcheck.start_period_secs,
        interval_secs = config.healthcheck.interval_secs,
        timeout_secs = config.healthcheck.timeout_secs,
        success_threshold = config.healthcheck.success_threshold,
        startup_deadline_secs = config.healthcheck.startup_deadline_secs,
        "Readiness gate settings"
    );
    info!(
        route_count = if config.routes.is_empty() {
            roost::router::RouteTable::default_table().rules().len()
        } else {
            config.routes.len()
        },
        default_table = config.routes.is_empty(),
        "Routing table"
    );
}
