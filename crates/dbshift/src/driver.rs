//! The polymorphic driver contract every supported engine implements.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::catalog::{DatabaseSchema, InstanceUser};
use crate::error::{DriverError, Result};
use crate::migration::{MigrationHistory, MigrationHistoryFind, MigrationInfo};

/// Name of the internal database that hosts `migration_history` when the
/// driver is not confined to a single database.
pub const INTERNAL_DATABASE: &str = "bytebase";

/// Supported engine kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineType {
    Postgres,
    Mysql,
}

impl EngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::Postgres => "POSTGRES",
            EngineType::Mysql => "MYSQL",
        }
    }
}

impl FromStr for EngineType {
    type Err = DriverError;

    /// Parse an engine tag or URL scheme. `pg`, `postgresql` and `pgsql`
    /// normalize to `postgres`.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mysql" => Ok(EngineType::Mysql),
            "postgres" | "postgresql" | "pgsql" | "pg" => Ok(EngineType::Postgres),
            other => Err(DriverError::Config(format!(
                "unknown engine {other:?}; supported: mysql, postgres"
            ))),
        }
    }
}

/// Result of an ad-hoc query: column names plus row values rendered as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// The driver contract.
///
/// One driver instance holds one pooled connection set for the lifetime of the
/// process and is closed on teardown. Implementations do not serialize
/// concurrent callers; the underlying pool enforces at-most-one active
/// statement per connection.
#[async_trait]
pub trait Driver: HistoryExecutor + Send + Sync {
    /// The engine this driver speaks.
    fn engine_type(&self) -> EngineType;

    /// Close the connection pool.
    async fn close(&self) -> Result<()>;

    /// Check liveness of the current connection.
    async fn ping(&self) -> Result<()>;

    /// Engine server version string.
    async fn get_version(&self) -> Result<String>;

    /// Switch the active connection set to `database`.
    async fn use_database(&self, database: &str) -> Result<()>;

    /// Execute a possibly multi-statement script under the engine's
    /// transactional discipline.
    async fn execute(&self, statement: &str) -> Result<()>;

    /// Run a query, returning at most `limit` rows (0 means no limit).
    async fn query(&self, statement: &str, limit: usize) -> Result<QueryResult>;

    /// Reconstruct the normalized catalog from live introspection.
    async fn sync_schema(&self) -> Result<(Vec<InstanceUser>, Vec<DatabaseSchema>)>;

    /// Whether the migration history storage still needs to be provisioned.
    async fn needs_setup_migration(&self) -> Result<bool>;

    /// Provision the migration history storage when missing.
    async fn setup_migration_if_needed(&self) -> Result<()>;

    /// Execute a migration under history discipline. Returns the history row
    /// id and the post-execution schema dump.
    async fn execute_migration(
        &self,
        info: &MigrationInfo,
        statement: &str,
        cancel: &CancellationToken,
    ) -> Result<(i64, String)>;

    /// Query migration history, newest first.
    async fn find_migration_history(
        &self,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>>;

    /// Dump one database (or, when `database` is `None`, every non-system
    /// database) into `out`.
    async fn dump(
        &self,
        database: Option<&str>,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        schema_only: bool,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Execute a pre-formatted dump script in a single transaction.
    async fn restore(&self, script: &str) -> Result<()>;
}

/// History-executor capability set.
///
/// The generic migration executor is polymorphic over this trait; every
/// driver implements it against its own history storage.
#[async_trait]
pub trait HistoryExecutor: Send + Sync {
    /// Take the engine-level advisory lock for `namespace`, serializing
    /// concurrent migrations against the same database.
    async fn lock_namespace(&self, namespace: &str) -> Result<()>;

    /// Release the advisory lock for `namespace`.
    async fn unlock_namespace(&self, namespace: &str) -> Result<()>;

    /// Largest stored version among non-failed rows since the most recent
    /// `BASELINE`/`BRANCH` in `namespace`, or `None` when there is none.
    async fn find_largest_version_since_baseline(
        &self,
        namespace: &str,
    ) -> Result<Option<String>>;

    /// Largest sequence in `namespace`; restricted to `BASELINE`/`BRANCH`
    /// rows when `baseline_only`. Returns 0 when the namespace is empty.
    async fn find_largest_sequence(&self, namespace: &str, baseline_only: bool) -> Result<i64>;

    /// Insert a `PENDING` history row and return its id.
    async fn insert_pending_history(
        &self,
        sequence: i64,
        prev_schema: &str,
        info: &MigrationInfo,
        stored_version: &str,
        statement: &str,
    ) -> Result<i64>;

    /// Finalize a `PENDING` row as `DONE`.
    async fn update_history_as_done(
        &self,
        duration_ns: i64,
        updated_schema: &str,
        id: i64,
    ) -> Result<()>;

    /// Finalize a `PENDING` row as `FAILED`.
    async fn update_history_as_failed(&self, duration_ns: i64, id: i64) -> Result<()>;

    /// Promote `PENDING` rows older than `older_than` to `FAILED`; the
    /// background reaper's hook. Returns the number of rows promoted.
    async fn update_stale_pending_as_failed(&self, older_than: Duration) -> Result<u64>;

    /// Execute user SQL through the engine's transactional path.
    async fn execute_statement(&self, statement: &str) -> Result<()>;

    /// Schema-only dump of one database, as a string snapshot.
    async fn dump_database_schema(&self, database: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_aliases_normalize() {
        assert_eq!("pg".parse::<EngineType>().unwrap(), EngineType::Postgres);
        assert_eq!(
            "postgresql".parse::<EngineType>().unwrap(),
            EngineType::Postgres
        );
        assert_eq!("pgsql".parse::<EngineType>().unwrap(), EngineType::Postgres);
        assert_eq!("MYSQL".parse::<EngineType>().unwrap(), EngineType::Mysql);
        assert!("sqlite".parse::<EngineType>().is_err());
    }
}
