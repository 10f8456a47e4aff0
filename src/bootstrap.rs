//! Idempotent Postgres provisioning for the application
//!
//! Runs once at startup over an administrative connection: installs missing
//! extensions, creates the application login role, and creates the
//! application database with privileges and ownership transferred to that
//! role. Every step is existence-guarded, so re-running after a partial
//! failure performs only the remaining work and never errors on work already
//! done.

use thiserror::Error;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

/// Error type for bootstrap operations
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

/// What to provision. The password arrives from the environment, never from
/// configuration literals.
#[derive(Debug, Clone)]
pub struct BootstrapSpec {
    pub role: String,
    pub password: String,
    pub database: String,
    pub extensions: Vec<String>,
}

/// Work performed by a bootstrap run; empty on a repeat run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BootstrapOutcome {
    pub extensions_created: Vec<String>,
    pub role_created: bool,
    pub database_created: bool,
}

impl BootstrapOutcome {
    pub fn is_noop(&self) -> bool {
        self.extensions_created.is_empty() && !self.role_created && !self.database_created
    }
}

const EXTENSION_EXISTS: &str = "SELECT 1 FROM pg_extension WHERE extname = $1";
const ROLE_EXISTS: &str = "SELECT 1 FROM pg_roles WHERE rolname = $1";
const DATABASE_EXISTS: &str = "SELECT 1 FROM pg_database WHERE datname = $1";

/// The two statement shapes provisioning needs from the administrative
/// connection, split out so the check-then-create control flow can be
/// exercised without a live server.
trait AdminExec {
    async fn row_exists(&self, query: &str, name: &str) -> Result<bool, BootstrapError>;
    async fn execute(&self, stmt: &str) -> Result<(), BootstrapError>;
}

impl AdminExec for Client {
    async fn row_exists(&self, query: &str, name: &str) -> Result<bool, BootstrapError> {
        Ok(self.query_opt(query, &[&name]).await?.is_some())
    }

    async fn execute(&self, stmt: &str) -> Result<(), BootstrapError> {
        self.batch_execute(stmt).await?;
        Ok(())
    }
}

/// Run the bootstrap against the administrative connection URL
pub async fn run(admin_url: &str, spec: &BootstrapSpec) -> Result<BootstrapOutcome, BootstrapError> {
    let (client, connection) = tokio_postgres::connect(admin_url, NoTls).await?;

    // tokio-postgres splits the client from the connection driver
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "Administrative connection error");
        }
    });

    let outcome = provision(&client, spec).await;

    drop(client);
    let _ = driver.await;

    outcome
}

async fn provision<E: AdminExec>(
    admin: &E,
    spec: &BootstrapSpec,
) -> Result<BootstrapOutcome, BootstrapError> {
    let mut outcome = BootstrapOutcome::default();

    for extension in &spec.extensions {
        if admin.row_exists(EXTENSION_EXISTS, extension).await? {
            debug!(extension = %extension, "Extension already installed");
        } else {
            admin.execute(&create_extension_stmt(extension)).await?;
            info!(extension = %extension, "Extension installed");
            outcome.extensions_created.push(extension.clone());
        }
    }

    if admin.row_exists(ROLE_EXISTS, &spec.role).await? {
        debug!(role = %spec.role, "Role already exists");
    } else {
        admin
            .execute(&create_role_stmt(&spec.role, &spec.password))
            .await?;
        info!(role = %spec.role, "Login role created");
        outcome.role_created = true;
    }

    if admin.row_exists(DATABASE_EXISTS, &spec.database).await? {
        debug!(database = %spec.database, "Database already exists");
    } else {
        // CREATE DATABASE cannot run inside a transaction block; each
        // statement goes out on its own.
        admin.execute(&create_database_stmt(&spec.database)).await?;
        admin
            .execute(&grant_privileges_stmt(&spec.database, &spec.role))
            .await?;
        admin
            .execute(&transfer_ownership_stmt(&spec.database, &spec.role))
            .await?;
        info!(database = %spec.database, owner = %spec.role, "Database created");
        outcome.database_created = true;
    }

    Ok(outcome)
}

/// Quote an SQL identifier. Role, database, and extension names come from
/// configuration and must not be interpolated bare.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an SQL string literal
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn create_extension_stmt(name: &str) -> String {
    format!("CREATE EXTENSION {}", quote_ident(name))
}

fn create_role_stmt(role: &str, password: &str) -> String {
    format!(
        "CREATE ROLE {} WITH LOGIN PASSWORD {}",
        quote_ident(role),
        quote_literal(password)
    )
}

fn create_database_stmt(database: &str) -> String {
    format!("CREATE DATABASE {} ENCODING 'utf8'", quote_ident(database))
}

fn grant_privileges_stmt(database: &str, role: &str) -> String {
    format!(
        "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
        quote_ident(database),
        quote_ident(role)
    )
}

fn transfer_ownership_stmt(database: &str, role: &str) -> String {
    format!(
        "ALTER DATABASE {} OWNER TO {}",
        quote_ident(database),
        quote_ident(role)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory stand-in for the administrative connection: keeps a catalog
    /// of what exists and applies the DDL it is handed to that catalog.
    #[derive(Default)]
    struct FakeAdmin {
        state: Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        extensions: HashSet<String>,
        roles: HashSet<String>,
        databases: HashSet<String>,
        statements: Vec<String>,
    }

    fn unquote(ident: &str) -> String {
        ident.trim_matches('"').replace("\"\"", "\"")
    }

    impl AdminExec for FakeAdmin {
        async fn row_exists(&self, query: &str, name: &str) -> Result<bool, BootstrapError> {
            let state = self.state.lock().unwrap();
            let found = match query {
                EXTENSION_EXISTS => state.extensions.contains(name),
                ROLE_EXISTS => state.roles.contains(name),
                DATABASE_EXISTS => state.databases.contains(name),
                other => panic!("unexpected existence query: {other}"),
            };
            Ok(found)
        }

        async fn execute(&self, stmt: &str) -> Result<(), BootstrapError> {
            let mut state = self.state.lock().unwrap();
            state.statements.push(stmt.to_string());

            if let Some(rest) = stmt.strip_prefix("CREATE EXTENSION ") {
                state.extensions.insert(unquote(rest));
            } else if let Some(rest) = stmt.strip_prefix("CREATE ROLE ") {
                let name = rest.split_whitespace().next().unwrap();
                state.roles.insert(unquote(name));
            } else if let Some(rest) = stmt.strip_prefix("CREATE DATABASE ") {
                let name = rest.split_whitespace().next().unwrap();
                state.databases.insert(unquote(name));
            }
            Ok(())
        }
    }

    fn spec() -> BootstrapSpec {
        BootstrapSpec {
            role: "tweets".to_string(),
            password: "s3cret".to_string(),
            database: "tweets".to_string(),
            extensions: vec!["citext".to_string()],
        }
    }

    #[tokio::test]
    async fn test_first_run_provisions_in_order() {
        let admin = FakeAdmin::default();
        let outcome = provision(&admin, &spec()).await.unwrap();

        assert_eq!(outcome.extensions_created, vec!["citext".to_string()]);
        assert!(outcome.role_created);
        assert!(outcome.database_created);

        let state = admin.state.lock().unwrap();
        assert_eq!(state.statements.len(), 5);
        assert!(state.statements[0].starts_with("CREATE EXTENSION"));
        assert!(state.statements[1].starts_with("CREATE ROLE"));
        assert!(state.statements[2].starts_with("CREATE DATABASE"));
        assert!(state.statements[3].starts_with("GRANT ALL PRIVILEGES"));
        assert!(state.statements[4].starts_with("ALTER DATABASE"));
    }

    #[tokio::test]
    async fn test_second_run_is_a_noop() {
        let admin = FakeAdmin::default();

        let first = provision(&admin, &spec()).await.unwrap();
        assert!(!first.is_noop());
        let after_first = admin.state.lock().unwrap().statements.len();

        let second = provision(&admin, &spec()).await.unwrap();
        assert!(second.is_noop());

        let state = admin.state.lock().unwrap();
        assert_eq!(state.statements.len(), after_first, "no DDL on re-run");
        assert_eq!(state.roles.len(), 1);
        assert_eq!(state.databases.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_state_rerun_completes_remaining_work() {
        let admin = FakeAdmin::default();
        // role survived an earlier run that failed before the database step
        admin
            .state
            .lock()
            .unwrap()
            .roles
            .insert("tweets".to_string());

        let outcome = provision(&admin, &spec()).await.unwrap();
        assert!(!outcome.role_created);
        assert!(outcome.database_created);

        let state = admin.state.lock().unwrap();
        assert!(!state
            .statements
            .iter()
            .any(|stmt| stmt.starts_with("CREATE ROLE")));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("tweets"), "\"tweets\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("s3cret"), "'s3cret'");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_create_role_stmt_quotes_password() {
        let stmt = create_role_stmt("tweets", "p'w");
        assert_eq!(stmt, "CREATE ROLE \"tweets\" WITH LOGIN PASSWORD 'p''w'");
    }

    #[test]
    fn test_database_statements() {
        assert_eq!(
            create_database_stmt("tweets"),
            "CREATE DATABASE \"tweets\" ENCODING 'utf8'"
        );
        assert_eq!(
            grant_privileges_stmt("tweets", "tweets"),
            "GRANT ALL PRIVILEGES ON DATABASE \"tweets\" TO \"tweets\""
        );
        assert_eq!(
            transfer_ownership_stmt("tweets", "tweets"),
            "ALTER DATABASE \"tweets\" OWNER TO \"tweets\""
        );
    }

    #[test]
    fn test_create_extension_stmt() {
        assert_eq!(create_extension_stmt("citext"), "CREATE EXTENSION \"citext\"");
    }

    #[test]
    fn test_outcome_noop() {
        assert!(BootstrapOutcome::default().is_noop());

        let outcome = BootstrapOutcome {
            role_created: true,
            ..BootstrapOutcome::default()
        };
        assert!(!outcome.is_noop());
    }
}
