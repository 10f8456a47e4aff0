use crate::router::{RouteAction, RouteMatcher, RouteRule, RouteTable};
use serde::Deserialize;
use std::path::Path;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream backend configuration
    #[serde(default)]
    pub upstream: UpstreamSettings,

    /// Static root configuration
    #[serde(default, rename = "static")]
    pub static_files: StaticConfig,

    /// Database provisioning configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Database readiness gate configuration
    #[serde(default)]
    pub healthcheck: HealthGateConfig,

    /// Routing table; when empty the built-in default table applies
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listener port (default: 1200)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Keep-alive idle timeout in seconds (default: 65)
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    /// Maximum declared request body size in bytes (default: 4 GiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    /// Maximum simultaneous connections; excess queues in the accept backlog
    /// (default: 1024)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            max_body_bytes: default_max_body_bytes(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamSettings {
    /// Upstream authority, host:port (default: 127.0.0.1:5000)
    #[serde(default = "default_upstream_addr")]
    pub addr: String,

    /// Maximum idle connections kept to the upstream (default: 10)
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Maximum time to wait for an upstream response in seconds (default: 60)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            addr: default_upstream_addr(),
            pool_max_idle: default_pool_max_idle(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StaticConfig {
    /// Filesystem directory served directly, read-only (default: ./public)
    #[serde(default = "default_static_root")]
    pub root: String,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            root: default_static_root(),
        }
    }
}

/// Database provisioning settings. Secrets are never written here: the
/// fields name environment variables holding the administrative connection
/// URL and the role password.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Run the bootstrap at startup (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Environment variable holding the administrative connection URL
    #[serde(default = "default_admin_url_env")]
    pub admin_url_env: String,

    /// Environment variable holding the application role password
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// Login role to provision for the application (default: tweets)
    #[serde(default = "default_role_name")]
    pub role: String,

    /// Database to provision, owned by the role (default: tweets)
    #[serde(default = "default_database_name")]
    pub database: String,

    /// Extensions to install when absent (default: none)
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            admin_url_env: default_admin_url_env(),
            password_env: default_password_env(),
            role: default_role_name(),
            database: default_database_name(),
            extensions: Vec::new(),
        }
    }
}

impl DatabaseConfig {
    /// Administrative connection URL, resolved from the environment
    pub fn admin_url(&self) -> anyhow::Result<String> {
        std::env::var(&self.admin_url_env).map_err(|_| {
            anyhow::anyhow!(
                "environment variable {} must hold the administrative database URL \
                 (credentials are not read from the config file)",
                self.admin_url_env
            )
        })
    }

    /// Application role password, resolved from the environment
    pub fn password(&self) -> anyhow::Result<String> {
        std::env::var(&self.password_env).map_err(|_| {
            anyhow::anyhow!(
                "environment variable {} must hold the password for role '{}'",
                self.password_env,
                self.role
            )
        })
    }
}

/// Readiness gate settings; defaults mirror the deployment healthcheck
/// (6s grace, probes every 3s, ready after 3 consecutive successes).
#[derive(Debug, Deserialize, Clone)]
pub struct HealthGateConfig {
    /// Gate the listener on database readiness (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Grace period before the first probe, in seconds (default: 6)
    #[serde(default = "default_start_period")]
    pub start_period_secs: u64,

    /// Interval between probes, in seconds (default: 3)
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,

    /// Per-probe connect timeout, in seconds (default: 3)
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    /// Consecutive successes required for readiness (default: 3)
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Consecutive failures before readiness is revoked (default: 3)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Overall deadline for the startup wait, in seconds (default: 60)
    #[serde(default = "default_startup_deadline")]
    pub startup_deadline_secs: u64,
}

impl Default for HealthGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_period_secs: default_start_period(),
            interval_secs: default_probe_interval(),
            timeout_secs: default_probe_timeout(),
            success_threshold: default_success_threshold(),
            failure_threshold: default_failure_threshold(),
            startup_deadline_secs: default_startup_deadline(),
        }
    }
}

/// What a configured route does with a matched request
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RouteActionKind {
    /// Serve one fixed file from the static root
    File,
    /// Serve directly from the static root, 404 when absent
    Static,
    /// Try the static root first, then forward to the upstream
    StaticOrUpstream,
    /// Redirect to the scheme+host root
    Redirect,
}

/// One `[[routes]]` entry; exactly one of `exact` or `prefix` must be set
#[derive(Debug, Deserialize, Clone)]
pub struct RouteEntry {
    pub exact: Option<String>,
    pub prefix: Option<String>,
    pub action: RouteActionKind,

    /// File to serve, relative to the static root (action = "file")
    pub file: Option<String>,

    /// Remove the matched prefix before resolving against the static root
    /// (action = "static")
    #[serde(default)]
    pub strip_prefix: bool,

    /// Redirect status code (action = "redirect", default: 301)
    #[serde(default = "default_redirect_status")]
    pub status: u16,
}

impl RouteEntry {
    fn matcher(&self) -> Result<RouteMatcher, String> {
        match (&self.exact, &self.prefix) {
            (Some(path), None) => Ok(RouteMatcher::Exact(path.clone())),
            (None, Some(path)) => Ok(RouteMatcher::Prefix(path.clone())),
            (Some(_), Some(_)) => {
                Err("route sets both 'exact' and 'prefix'; pick one".to_string())
            }
            (None, None) => Err("route needs 'exact' or 'prefix'".to_string()),
        }
    }

    pub fn to_rule(&self) -> Result<RouteRule, String> {
        let matcher = self.matcher()?;
        let action = match self.action {
            RouteActionKind::File => {
                let file = self
                    .file
                    .clone()
                    .ok_or_else(|| "route action 'file' needs a 'file' field".to_string())?;
                RouteAction::File(file)
            }
            RouteActionKind::Static => RouteAction::Static {
                strip_prefix: self.strip_prefix,
            },
            RouteActionKind::StaticOrUpstream => RouteAction::StaticOrUpstream,
            RouteActionKind::Redirect => {
                if !(300..400).contains(&self.status) {
                    return Err(format!(
                        "route redirect status {} is not a 3xx code",
                        self.status
                    ));
                }
                RouteAction::Redirect {
                    status: self.status,
                }
            }
        };
        Ok(RouteRule { matcher, action })
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.max_connections == 0 {
            errors.push("server.max_connections must be non-zero".to_string());
        }
        if self.upstream.addr.is_empty() {
            errors.push("upstream.addr must not be empty".to_string());
        }
        if self.healthcheck.success_threshold == 0 {
            errors.push("healthcheck.success_threshold must be non-zero".to_string());
        }
        if self.healthcheck.failure_threshold == 0 {
            errors.push("healthcheck.failure_threshold must be non-zero".to_string());
        }

        for (index, entry) in self.routes.iter().enumerate() {
            if let Err(e) = entry.to_rule() {
                errors.push(format!("routes[{}]: {}", index, e));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Build the routing table; an empty `[[routes]]` list means the
    /// built-in default table.
    pub fn route_table(&self) -> anyhow::Result<RouteTable> {
        if self.routes.is_empty() {
            return Ok(RouteTable::default_table());
        }
        let rules = self
            .routes
            .iter()
            .map(|entry| entry.to_rule())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(RouteTable::new(rules))
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    1200
}

fn default_keepalive_timeout() -> u64 {
    65
}

fn default_max_body_bytes() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_max_connections() -> usize {
    1024
}

fn default_upstream_addr() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_pool_max_idle() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    60
}

fn default_static_root() -> String {
    "./public".to_string()
}

fn default_true() -> bool {
    true
}

fn default_admin_url_env() -> String {
    "ROOST_ADMIN_DB_URL".to_string()
}

fn default_password_env() -> String {
    "ROOST_DB_PASSWORD".to_string()
}

fn default_role_name() -> String {
    "tweets".to_string()
}

fn default_database_name() -> String {
    "tweets".to_string()
}

fn default_start_period() -> u64 {
    6
}

fn default_probe_interval() -> u64 {
    3
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_success_threshold() -> u32 {
    3
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_startup_deadline() -> u64 {
    60
}

fn default_redirect_status() -> u16 {
    301
}
