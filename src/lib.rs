//! Roost - edge gateway for a tweets API
//!
//! This library provides the front door of the deployment:
//! - Routes HTTP traffic by request path to a static root or a single upstream
//! - Serves static files directly, with an upstream fallback under `/api/`
//! - Provisions the application's Postgres role and database idempotently
//! - Gates traffic on a database readiness probe before accepting connections
//! - Uses connection pooling for efficient upstream communication

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod health;
pub mod proxy;
pub mod router;
pub mod static_files;
pub mod upstream;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
