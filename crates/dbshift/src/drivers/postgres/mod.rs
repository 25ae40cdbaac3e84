//! PostgreSQL engine driver.
//!
//! One driver instance owns a pooled connection set to the active database
//! plus a separate set pinned to the migration history database. Database
//! switches rebuild the active pool; the history pool never moves.

mod dump;
mod introspect;
mod keywords;

pub use keywords::quote_identifier;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, RwLock};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Config as PgConfig, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{DatabaseSchema, InstanceUser};
use crate::config::ConnectionConfig;
use crate::driver::{
    Driver, EngineType, HistoryExecutor, QueryResult, INTERNAL_DATABASE,
};
use crate::drivers::common::TlsBuilder;
use crate::error::{DriverError, Result};
use crate::migration::{
    MigrationHistory, MigrationHistoryFind, MigrationInfo, MigrationSource, MigrationStatus,
    MigrationType,
};
use crate::registry::DriverContext;
use crate::splitter::StatementSplitter;
use crate::version::{from_stored_version, to_stored_version, NON_SEMANTIC_PREFIX};
use crate::{executor, MAX_POOL_SIZE};

/// Embedded DDL for the `migration_history` table.
const MIGRATION_SCHEMA: &str = include_str!("migration_schema.sql");

/// Databases that are never synced or dumped.
const SYSTEM_DATABASES: &[&str] = &["template0", "template1"];

/// Databases excluded from schema sync on top of the system set: the internal
/// history database and cloud-provider internals.
const SYNC_EXCLUDED_DATABASES: &[&str] = &[INTERNAL_DATABASE, "rdsadmin", "cloudsql"];

/// One row of `pg_database`.
#[derive(Debug, Clone)]
struct PgDatabase {
    name: String,
    encoding: String,
    collate: String,
}

struct ActiveState {
    pool: Pool,
    database: Option<String>,
}

/// PostgreSQL driver.
pub struct PostgresDriver {
    ctx: DriverContext,
    config: ConnectionConfig,
    strict_database: Option<String>,
    state: RwLock<ActiveState>,
    history_pool: RwLock<Option<Pool>>,
    /// Advisory locks are session-scoped; the locking connection is parked
    /// here until release.
    namespace_locks: Mutex<HashMap<String, Object>>,
}

impl PostgresDriver {
    /// Open a driver, discovering a connectable database when none is named.
    ///
    /// Discovery order: server-level connect, the internal history database,
    /// `postgres`, `template1`. Strict database mode pins the named database
    /// and skips discovery.
    pub async fn open(ctx: DriverContext, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;

        let candidates: Vec<Option<String>> = match &config.database {
            Some(db) => vec![Some(db.clone())],
            None => vec![
                None,
                Some(INTERNAL_DATABASE.to_string()),
                Some("postgres".to_string()),
                Some("template1".to_string()),
            ],
        };

        let mut last_error = None;
        for candidate in candidates {
            let pool = Self::build_pool(&config, candidate.as_deref())?;
            match Self::ping_pool(&pool).await {
                Ok(()) => {
                    info!(
                        host = %config.host,
                        port = config.port,
                        database = candidate.as_deref().unwrap_or("<server>"),
                        "connected to PostgreSQL instance"
                    );
                    let strict_database = config
                        .strict_database
                        .then(|| config.database.clone())
                        .flatten();
                    return Ok(Self {
                        ctx,
                        strict_database,
                        state: RwLock::new(ActiveState {
                            pool,
                            database: candidate,
                        }),
                        history_pool: RwLock::new(None),
                        namespace_locks: Mutex::new(HashMap::new()),
                        config,
                    });
                }
                Err(e) => {
                    debug!(
                        database = candidate.as_deref().unwrap_or("<server>"),
                        error = %e,
                        "connection candidate failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(DriverError::Authentication(m)) => DriverError::Authentication(m),
            _ => DriverError::Connection(match &config.database {
                Some(db) => format!(
                    "cannot connect to {db:?} on {}:{}; check the connection info and that the database exists",
                    config.host, config.port
                ),
                None => format!(
                    "cannot connect to instance {}:{}; check the connection info",
                    config.host, config.port
                ),
            }),
        })
    }

    /// Build a pool for one database. Connections are established lazily.
    fn build_pool(config: &ConnectionConfig, database: Option<&str>) -> Result<Pool> {
        let mut pg_config = PgConfig::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .user(&config.username);
        if !config.password.is_empty() {
            pg_config.password(&config.password);
        }
        if let Some(db) = database {
            pg_config.dbname(db);
        }
        if config.read_only {
            pg_config.options("-c default_transaction_read_only=on");
        }

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let pool = match TlsBuilder::new(&config.tls).build_postgres()? {
            Some(tls) => {
                let mgr = Manager::from_config(pg_config, tls, mgr_config);
                Pool::builder(mgr).max_size(MAX_POOL_SIZE).build()
            }
            None => {
                let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
                Pool::builder(mgr).max_size(MAX_POOL_SIZE).build()
            }
        }
        .map_err(|e| DriverError::Connection(format!("failed to build connection pool: {e}")))?;
        Ok(pool)
    }

    async fn ping_pool(pool: &Pool) -> Result<()> {
        let client = pool.get().await.map_err(map_pool_error)?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn client(&self) -> Result<Object> {
        let state = self.state.read().await;
        state.pool.get().await.map_err(map_pool_error)
    }

    /// The database hosting `migration_history`.
    fn history_database(&self) -> &str {
        self.strict_database.as_deref().unwrap_or(INTERNAL_DATABASE)
    }

    async fn history_client(&self) -> Result<Object> {
        {
            let pool = self.history_pool.read().await;
            if let Some(pool) = pool.as_ref() {
                return pool.get().await.map_err(map_pool_error);
            }
        }
        let mut slot = self.history_pool.write().await;
        if slot.is_none() {
            *slot = Some(Self::build_pool(&self.config, Some(self.history_database()))?);
        }
        slot.as_ref().unwrap().get().await.map_err(map_pool_error)
    }

    async fn get_databases(&self) -> Result<Vec<PgDatabase>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT datname, pg_encoding_to_char(encoding), datcollate FROM pg_database",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| PgDatabase {
                name: row.get(0),
                encoding: row.get(1),
                collate: row.get(2),
            })
            .collect())
    }

    async fn has_internal_database(&self) -> Result<bool> {
        Ok(self
            .get_databases()
            .await?
            .iter()
            .any(|d| d.name == INTERNAL_DATABASE))
    }

    async fn get_user_list(&self) -> Result<Vec<InstanceUser>> {
        let query = "\
            SELECT usename AS role_name,
                CASE
                    WHEN usesuper AND usecreatedb THEN
                        CAST('superuser, create database' AS pg_catalog.text)
                    WHEN usesuper THEN
                        CAST('superuser' AS pg_catalog.text)
                    WHEN usecreatedb THEN
                        CAST('create database' AS pg_catalog.text)
                    ELSE
                        CAST('' AS pg_catalog.text)
                END role_attributes
            FROM pg_catalog.pg_user
            ORDER BY role_name";
        let client = self.client().await?;
        let rows = client.query(query, &[]).await?;
        Ok(rows
            .into_iter()
            .map(|row| InstanceUser {
                name: row.get(0),
                grant: row.get(1),
            })
            .collect())
    }

    /// List migration history rows, decoding stored versions.
    async fn list_history(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<MigrationHistory>> {
        let client = self.history_client().await?;
        let rows = client.query(query, params).await?;
        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            let stored: String = row.get(11);
            let (_, version, _) = from_stored_version(&stored)?;
            let source: String = row.get(8);
            let migration_type: String = row.get(9);
            let status: String = row.get(10);
            history.push(MigrationHistory {
                id: row.get(0),
                creator: row.get(1),
                created_ts: row.get(2),
                updater: row.get(3),
                updated_ts: row.get(4),
                release_version: row.get(5),
                namespace: row.get(6),
                sequence: row.get(7),
                source: MigrationSource::parse(&source)?,
                migration_type: MigrationType::parse(&migration_type)?,
                status: MigrationStatus::parse(&status)?,
                version,
                description: row.get(12),
                statement: row.get(13),
                schema: row.get(14),
                schema_prev: row.get(15),
                execution_duration_ns: row.get(16),
                issue_id: row.get(17),
                payload: row.get(18),
            });
        }
        Ok(history)
    }

    /// One-time backfill: rewrite history rows whose version predates the
    /// canonical stored form.
    async fn backfill_stored_versions(&self) -> Result<()> {
        let client = self.history_client().await?;
        let rows = client
            .query("SELECT id, version FROM migration_history", &[])
            .await?;

        let mut updated = 0u64;
        for row in &rows {
            let id: i64 = row.get(0);
            let version: String = row.get(1);
            if from_stored_version(&version).is_ok() {
                continue;
            }
            let new_version = format!("{NON_SEMANTIC_PREFIX}{version}");
            client
                .execute(
                    "UPDATE migration_history SET version = $1 WHERE id = $2 AND version = $3",
                    &[&new_version, &id, &version],
                )
                .await?;
            updated += 1;
        }
        info!(updated, "backfilled legacy migration history versions");
        Ok(())
    }

    fn namespace_lock_key(namespace: &str) -> i64 {
        let digest = Sha256::digest(namespace.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes)
    }
}

/// Translate a statement-execution error into the driver taxonomy.
fn map_execute_error(e: tokio_postgres::Error, statement: &str) -> DriverError {
    if let Some(db_err) = e.as_db_error() {
        // Class 23: integrity constraint violations.
        if db_err.code().code().starts_with("23") {
            return DriverError::IntegrityViolation(db_err.message().to_string());
        }
    }
    DriverError::from(e).with_statement(statement)
}

fn map_pool_error(e: deadpool_postgres::PoolError) -> DriverError {
    if let deadpool_postgres::PoolError::Backend(pg) = &e {
        if let Some(db_err) = pg.as_db_error() {
            if db_err.code() == &SqlState::INVALID_PASSWORD
                || db_err.code() == &SqlState::INVALID_AUTHORIZATION_SPECIFICATION
            {
                return DriverError::Authentication(db_err.message().to_string());
            }
        }
    }
    DriverError::PostgresPool(e)
}

/// Statements that run outside the transactional batch.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ImmediateStatement {
    /// `CREATE DATABASE <name>`; a no-op when the database exists.
    CreateDatabase { name: String, statement: String },
    /// `ALTER DATABASE ... OWNER TO ...`.
    AlterDatabaseOwner(String),
    /// `\connect "<db>"`; switches the active connection.
    Connect(String),
}

/// Partition a script into immediate operations (in order) and the remaining
/// statements that run together in one transaction.
fn partition_statements(statements: &[String]) -> Result<(Vec<ImmediateStatement>, Vec<String>)> {
    let mut immediate = Vec::new();
    let mut remaining = Vec::new();

    for raw in statements {
        let stmt = raw.trim_start_matches([' ', '\t']);
        if stmt.starts_with("CREATE DATABASE ") {
            immediate.push(ImmediateStatement::CreateDatabase {
                name: create_database_name(stmt)?,
                statement: stmt.to_string(),
            });
        } else if stmt.starts_with("ALTER DATABASE") && stmt.contains(" OWNER TO ") {
            immediate.push(ImmediateStatement::AlterDatabaseOwner(stmt.to_string()));
        } else if stmt.starts_with("\\connect ") {
            let parts: Vec<&str> = stmt.split('"').collect();
            if parts.len() != 3 {
                return Err(DriverError::invalid_statement(
                    stmt,
                    "malformed \\connect directive",
                ));
            }
            immediate.push(ImmediateStatement::Connect(parts[1].to_string()));
        } else {
            remaining.push(stmt.to_string());
        }
    }

    Ok((immediate, remaining))
}

/// Extract the database name from a `CREATE DATABASE` statement.
fn create_database_name(statement: &str) -> Result<String> {
    let raw = statement
        .trim_end_matches(';')
        .trim_start_matches("CREATE DATABASE");
    let token = raw.split_whitespace().next().ok_or_else(|| {
        DriverError::invalid_statement(statement, "database name not found")
    })?;
    Ok(token.trim_matches('"').to_string())
}

#[async_trait]
impl Driver for PostgresDriver {
    fn engine_type(&self) -> EngineType {
        EngineType::Postgres
    }

    async fn close(&self) -> Result<()> {
        self.namespace_locks.lock().await.clear();
        self.state.read().await.pool.close();
        if let Some(pool) = self.history_pool.read().await.as_ref() {
            pool.close();
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let state = self.state.read().await;
        Self::ping_pool(&state.pool).await
    }

    async fn get_version(&self) -> Result<String> {
        let client = self.client().await?;
        let messages = client.simple_query("SHOW server_version").await?;
        for message in messages {
            if let tokio_postgres::SimpleQueryMessage::Row(row) = message {
                return Ok(row.get(0).unwrap_or_default().to_string());
            }
        }
        Err(DriverError::Internal(
            "SHOW server_version returned no rows".to_string(),
        ))
    }

    async fn use_database(&self, database: &str) -> Result<()> {
        if let Some(strict) = &self.strict_database {
            if database != strict {
                return Err(DriverError::NotSupported(format!(
                    "strict database mode is confined to {strict:?}; cannot switch to {database:?}"
                )));
            }
            return Ok(());
        }

        let mut state = self.state.write().await;
        if state.database.as_deref() == Some(database) {
            return Ok(());
        }
        let pool = Self::build_pool(&self.config, Some(database))?;
        let old = std::mem::replace(&mut state.pool, pool);
        old.close();
        state.database = Some(database.to_string());
        Ok(())
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        let statements = StatementSplitter::new(EngineType::Postgres).split(statement);
        let (immediate, remaining) = partition_statements(&statements)?;

        // Creating and altering databases cannot run inside a transaction.
        for op in immediate {
            match op {
                ImmediateStatement::CreateDatabase { name, statement } => {
                    let exists = self.get_databases().await?.iter().any(|d| d.name == name);
                    if !exists {
                        let client = self.client().await?;
                        client
                            .batch_execute(&statement)
                            .await
                            .map_err(|e| DriverError::from(e).with_statement(&statement))?;
                    }
                }
                ImmediateStatement::AlterDatabaseOwner(statement) => {
                    let client = self.client().await?;
                    client
                        .batch_execute(&statement)
                        .await
                        .map_err(|e| DriverError::from(e).with_statement(&statement))?;
                }
                ImmediateStatement::Connect(database) => {
                    self.use_database(&database).await?;
                }
            }
        }

        if remaining.is_empty() {
            return Ok(());
        }

        let mut client = self.client().await?;
        let tx = client.transaction().await?;

        // Objects created in the transaction belong to the database owner,
        // not the login role.
        let owner_row = tx
            .query_one(
                "SELECT u.rolname FROM pg_roles AS u \
                 JOIN pg_database AS d ON d.datdba = u.oid \
                 WHERE d.datname = current_database()",
                &[],
            )
            .await
            .map_err(|_| {
                DriverError::Internal("owner not found for the current database".to_string())
            })?;
        let owner: String = owner_row.get(0);
        tx.batch_execute(&format!("SET LOCAL ROLE {}", quote_identifier(&owner)))
            .await?;

        let batch = remaining.join("\n");
        tx.batch_execute(&batch)
            .await
            .map_err(|e| map_execute_error(e, &batch))?;
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, statement: &str, limit: usize) -> Result<QueryResult> {
        let client = self.client().await?;
        let messages = client
            .simple_query(statement)
            .await
            .map_err(|e| DriverError::from(e).with_statement(statement))?;

        let mut result = QueryResult::default();
        for message in messages {
            if let tokio_postgres::SimpleQueryMessage::Row(row) = message {
                if result.columns.is_empty() {
                    result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                if limit > 0 && result.rows.len() >= limit {
                    break;
                }
                let values = (0..row.len())
                    .map(|i| match row.get(i) {
                        Some(v) => serde_json::Value::String(v.to_string()),
                        None => serde_json::Value::Null,
                    })
                    .collect();
                result.rows.push(values);
            }
        }
        Ok(result)
    }

    async fn sync_schema(&self) -> Result<(Vec<InstanceUser>, Vec<DatabaseSchema>)> {
        let users = self.get_user_list().await?;
        let databases = self.get_databases().await?;

        let mut schemas = Vec::new();
        for database in databases {
            if SYSTEM_DATABASES.contains(&database.name.as_str())
                || SYNC_EXCLUDED_DATABASES.contains(&database.name.as_str())
            {
                continue;
            }
            if let Some(strict) = &self.strict_database {
                if &database.name != strict {
                    continue;
                }
            }

            self.use_database(&database.name).await?;
            let mut client = self.client().await?;
            let txn = client.build_transaction().read_only(true).start().await?;

            let indices = introspect::get_indices(&txn).await?;
            let mut tables = introspect::get_tables(&txn).await?;
            for index in indices {
                if let Some(table) = tables
                    .iter_mut()
                    .find(|t| t.schema == index.schema && t.name == index.table)
                {
                    table.indices.push(index);
                }
            }
            let views = introspect::get_views(&txn).await?;
            let extensions = introspect::get_extensions(&txn).await?;
            txn.commit().await?;

            let mut schema = DatabaseSchema {
                name: database.name,
                character_set: database.encoding,
                collation: database.collate,
                tables,
                views,
                extensions,
            };
            schema.normalize();
            debug!(
                database = %schema.name,
                tables = schema.tables.len(),
                views = schema.views.len(),
                "synced database schema"
            );
            schemas.push(schema);
        }

        Ok((users, schemas))
    }

    async fn needs_setup_migration(&self) -> Result<bool> {
        if self.strict_database.is_none() {
            if !self.has_internal_database().await? {
                return Ok(true);
            }
            self.use_database(INTERNAL_DATABASE).await?;
        }

        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM information_schema.tables WHERE table_name = 'migration_history'",
                &[],
            )
            .await?;
        Ok(row.is_none())
    }

    async fn setup_migration_if_needed(&self) -> Result<()> {
        if !self.needs_setup_migration().await? {
            return Ok(());
        }

        info!(
            host = %self.config.host,
            port = self.config.port,
            "migration history storage not found, provisioning"
        );

        if self.strict_database.is_none() {
            if !self.has_internal_database().await? {
                let statement = format!("CREATE DATABASE {INTERNAL_DATABASE}");
                let client = self.client().await?;
                client
                    .batch_execute(&statement)
                    .await
                    .map_err(|e| DriverError::from(e).with_statement(&statement))?;
            }
            self.use_database(INTERNAL_DATABASE).await?;
        }

        let client = self.client().await?;
        client
            .batch_execute(MIGRATION_SCHEMA)
            .await
            .map_err(|e| DriverError::from(e).with_statement(MIGRATION_SCHEMA))?;
        info!("provisioned migration history storage");
        Ok(())
    }

    async fn execute_migration(
        &self,
        info: &MigrationInfo,
        statement: &str,
        cancel: &CancellationToken,
    ) -> Result<(i64, String)> {
        // User SQL and schema dumps target the namespace; history rows go to
        // the pinned history pool.
        self.use_database(&info.namespace).await?;
        executor::execute_migration(self, info, statement, cancel).await
    }

    async fn find_migration_history(
        &self,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>> {
        let stored_version = match &find.version {
            Some(v) => Some(to_stored_version(false, v, "")?),
            None => None,
        };
        let source = find.source.map(|s| s.as_str().to_string());

        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if let Some(id) = &find.id {
            conditions.push(format!("id = ${}", params.len() + 1));
            params.push(id);
        }
        if let Some(namespace) = &find.namespace {
            conditions.push(format!("namespace = ${}", params.len() + 1));
            params.push(namespace);
        }
        if let Some(version) = &stored_version {
            conditions.push(format!("version = ${}", params.len() + 1));
            params.push(version);
        }
        if let Some(source) = &source {
            conditions.push(format!("source = ${}", params.len() + 1));
            params.push(source);
        }

        let mut query = String::from(
            "SELECT id, created_by, created_ts, updated_by, updated_ts, release_version, \
             namespace, sequence, source, type, status, version, description, statement, \
             \"schema\", schema_prev, execution_duration_ns, issue_id, payload \
             FROM migration_history",
        );
        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }
        query.push_str(" ORDER BY created_ts DESC, id DESC");
        if let Some(limit) = find.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        match self.list_history(&query, &params).await {
            Err(DriverError::InvalidStoredVersion(_)) => {
                self.backfill_stored_versions().await?;
                self.list_history(&query, &params).await
            }
            other => other,
        }
    }

    async fn dump(
        &self,
        database: Option<&str>,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        schema_only: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let databases = self.get_databases().await?;

        let dumpable: Vec<String> = match database {
            Some(name) => {
                if !databases.iter().any(|d| d.name == name) {
                    return Err(DriverError::Internal(format!("database {name:?} not found")));
                }
                vec![name.to_string()]
            }
            None => databases
                .into_iter()
                .filter(|d| !SYSTEM_DATABASES.contains(&d.name.as_str()))
                .map(|d| d.name)
                .collect(),
        };

        let include_connect = dumpable.len() > 1;
        for name in dumpable {
            dump::dump_one_database(
                &self.ctx.pg_bin_dir,
                &self.config,
                &name,
                out,
                schema_only,
                include_connect,
                cancel,
            )
            .await?;
        }
        Ok(())
    }

    async fn restore(&self, script: &str) -> Result<()> {
        let statements = StatementSplitter::new(EngineType::Postgres).split(script);

        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        for statement in &statements {
            tx.batch_execute(statement)
                .await
                .map_err(|e| map_execute_error(e, statement))?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryExecutor for PostgresDriver {
    async fn lock_namespace(&self, namespace: &str) -> Result<()> {
        let client = self.history_client().await?;
        let key = Self::namespace_lock_key(namespace);
        client
            .execute("SELECT pg_advisory_lock($1)", &[&key])
            .await?;
        self.namespace_locks
            .lock()
            .await
            .insert(namespace.to_string(), client);
        Ok(())
    }

    async fn unlock_namespace(&self, namespace: &str) -> Result<()> {
        let client = self.namespace_locks.lock().await.remove(namespace);
        let Some(client) = client else {
            warn!(namespace, "unlock without a held advisory lock");
            return Ok(());
        };
        let key = Self::namespace_lock_key(namespace);
        client
            .execute("SELECT pg_advisory_unlock($1)", &[&key])
            .await?;
        Ok(())
    }

    async fn find_largest_version_since_baseline(
        &self,
        namespace: &str,
    ) -> Result<Option<String>> {
        let largest_baseline_sequence = self.find_largest_sequence(namespace, true).await?;
        let client = self.history_client().await?;
        let row = client
            .query_one(
                "SELECT MAX(version) FROM migration_history \
                 WHERE namespace = $1 AND sequence >= $2 AND status != 'FAILED'",
                &[&namespace, &largest_baseline_sequence],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn find_largest_sequence(&self, namespace: &str, baseline_only: bool) -> Result<i64> {
        let mut query =
            String::from("SELECT MAX(sequence) FROM migration_history WHERE namespace = $1");
        if baseline_only {
            query.push_str(" AND (type = 'BASELINE' OR type = 'BRANCH')");
        }
        let client = self.history_client().await?;
        let row = client.query_one(&query, &[&namespace]).await?;
        Ok(row.get::<_, Option<i64>>(0).unwrap_or(0))
    }

    async fn insert_pending_history(
        &self,
        sequence: i64,
        prev_schema: &str,
        info: &MigrationInfo,
        stored_version: &str,
        statement: &str,
    ) -> Result<i64> {
        let client = self.history_client().await?;
        let row = client
            .query_one(
                "INSERT INTO migration_history (\
                 created_by, created_ts, updated_by, updated_ts, release_version, namespace, \
                 sequence, source, type, status, version, description, statement, \"schema\", \
                 schema_prev, execution_duration_ns, issue_id, payload) \
                 VALUES ($1, EXTRACT(epoch FROM now())::bigint, $2, EXTRACT(epoch FROM now())::bigint, \
                 $3, $4, $5, $6, $7, 'PENDING', $8, $9, $10, $11, $12, 0, $13, $14) \
                 RETURNING id",
                &[
                    &info.creator,
                    &info.creator,
                    &info.release_version,
                    &info.namespace,
                    &sequence,
                    &info.source.as_str(),
                    &info.migration_type.as_str(),
                    &stored_version,
                    &info.description,
                    &statement,
                    &prev_schema,
                    &prev_schema,
                    &info.issue_id,
                    &info.payload,
                ],
            )
            .await
            .map_err(|e| {
                if let Some(db_err) = e.as_db_error() {
                    if db_err.code() == &SqlState::UNIQUE_VIOLATION {
                        return DriverError::MigrationAlreadyApplied {
                            namespace: info.namespace.clone(),
                            version: info.version.clone(),
                        };
                    }
                }
                DriverError::Postgres(e)
            })?;
        Ok(row.get(0))
    }

    async fn update_history_as_done(
        &self,
        duration_ns: i64,
        updated_schema: &str,
        id: i64,
    ) -> Result<()> {
        let client = self.history_client().await?;
        client
            .execute(
                "UPDATE migration_history SET status = 'DONE', \
                 updated_ts = EXTRACT(epoch FROM now())::bigint, \
                 execution_duration_ns = $1, \"schema\" = $2 WHERE id = $3",
                &[&duration_ns, &updated_schema, &id],
            )
            .await?;
        Ok(())
    }

    async fn update_history_as_failed(&self, duration_ns: i64, id: i64) -> Result<()> {
        let client = self.history_client().await?;
        client
            .execute(
                "UPDATE migration_history SET status = 'FAILED', \
                 updated_ts = EXTRACT(epoch FROM now())::bigint, \
                 execution_duration_ns = $1 WHERE id = $2",
                &[&duration_ns, &id],
            )
            .await?;
        Ok(())
    }

    async fn update_stale_pending_as_failed(&self, older_than: Duration) -> Result<u64> {
        let cutoff_secs = i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX);
        let client = self.history_client().await?;
        let updated = client
            .execute(
                "UPDATE migration_history SET status = 'FAILED', \
                 updated_ts = EXTRACT(epoch FROM now())::bigint \
                 WHERE status = 'PENDING' \
                 AND created_ts < EXTRACT(epoch FROM now())::bigint - $1",
                &[&cutoff_secs],
            )
            .await?;
        Ok(updated)
    }

    async fn execute_statement(&self, statement: &str) -> Result<()> {
        Driver::execute(self, statement).await
    }

    async fn dump_database_schema(&self, database: &str) -> Result<String> {
        let mut buffer = Vec::new();
        let cancel = CancellationToken::new();
        dump::dump_one_database(
            &self.ctx.pg_bin_dir,
            &self.config,
            database,
            &mut buffer,
            true,
            false,
            &cancel,
        )
        .await?;
        String::from_utf8(buffer)
            .map_err(|e| DriverError::Internal(format!("pg_dump produced non-UTF-8 output: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(script: &str) -> Vec<String> {
        StatementSplitter::new(EngineType::Postgres).split(script)
    }

    #[test]
    fn partition_separates_database_level_statements() {
        let statements = split(
            "CREATE DATABASE appdb;\n\
             ALTER DATABASE appdb OWNER TO admin;\n\
             \\connect \"appdb\";\n\
             CREATE TABLE t (id INT);\n\
             INSERT INTO t VALUES (1);",
        );
        let (immediate, remaining) = partition_statements(&statements).unwrap();

        assert_eq!(
            immediate,
            vec![
                ImmediateStatement::CreateDatabase {
                    name: "appdb".into(),
                    statement: "CREATE DATABASE appdb".into(),
                },
                ImmediateStatement::AlterDatabaseOwner(
                    "ALTER DATABASE appdb OWNER TO admin".into()
                ),
                ImmediateStatement::Connect("appdb".into()),
            ]
        );
        assert_eq!(
            remaining,
            vec!["CREATE TABLE t (id INT)", "INSERT INTO t VALUES (1)"]
        );
    }

    #[test]
    fn partition_keeps_plain_scripts_transactional() {
        let statements = split("CREATE TABLE t(id INT); SELECT 1/0;");
        let (immediate, remaining) = partition_statements(&statements).unwrap();
        assert!(immediate.is_empty());
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn create_database_name_handles_quotes() {
        assert_eq!(create_database_name("CREATE DATABASE appdb;").unwrap(), "appdb");
        assert_eq!(
            create_database_name("CREATE DATABASE \"App Db\"").unwrap(),
            "App"
        );
        assert!(create_database_name("CREATE DATABASE ;").is_err());
    }

    #[test]
    fn malformed_connect_directive_is_invalid() {
        let statements = vec!["\\connect appdb".to_string()];
        assert!(matches!(
            partition_statements(&statements),
            Err(DriverError::InvalidStatement { .. })
        ));
    }

    #[test]
    fn namespace_lock_key_is_stable() {
        let a = PostgresDriver::namespace_lock_key("app");
        let b = PostgresDriver::namespace_lock_key("app");
        let c = PostgresDriver::namespace_lock_key("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
