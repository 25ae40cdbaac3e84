//! MySQL engine driver.
//!
//! Mirrors the PostgreSQL driver's contract with dialect substitutions:
//! no `CREATE DATABASE` carve-out, `GET_LOCK` advisory locks, and a
//! driver-side `SHOW CREATE` dump instead of an external tool.

mod introspect;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{params, Conn, Opts, OptsBuilder, Pool, SslOpts, TxOpts};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{DatabaseSchema, InstanceUser};
use crate::config::ConnectionConfig;
use crate::driver::{Driver, EngineType, HistoryExecutor, QueryResult, INTERNAL_DATABASE};
use crate::error::{DriverError, Result};
use crate::executor;
use crate::migration::{
    MigrationHistory, MigrationHistoryFind, MigrationInfo, MigrationSource, MigrationStatus,
    MigrationType,
};
use crate::splitter::StatementSplitter;
use crate::version::{from_stored_version, to_stored_version, NON_SEMANTIC_PREFIX};

/// Embedded DDL for the `migration_history` table.
const MIGRATION_SCHEMA: &str = include_str!("migration_schema.sql");

/// Engine-internal databases excluded from sync and dump.
const SYSTEM_DATABASES: &[&str] = &["mysql", "information_schema", "performance_schema", "sys"];

/// Seconds `GET_LOCK` waits before giving up.
const LOCK_TIMEOUT_SECS: u32 = 60;

struct ActiveState {
    pool: Pool,
    database: Option<String>,
}

/// MySQL driver.
pub struct MysqlDriver {
    config: ConnectionConfig,
    strict_database: Option<String>,
    state: RwLock<ActiveState>,
    history_pool: RwLock<Option<Pool>>,
    /// `GET_LOCK` locks are session-scoped; the locking connection is parked
    /// here until release.
    namespace_locks: Mutex<HashMap<String, Conn>>,
}

impl MysqlDriver {
    /// Open a driver against the configured instance.
    pub async fn open(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        if config.tls.ssl_cert.is_some() {
            return Err(DriverError::NotSupported(
                "client certificate authentication is not supported for MySQL".to_string(),
            ));
        }

        let pool = Pool::new(Self::build_opts(&config, config.database.as_deref()));
        let mut conn = pool.get_conn().await.map_err(map_mysql_error)?;
        conn.ping().await.map_err(map_mysql_error)?;
        drop(conn);

        info!(
            host = %config.host,
            port = config.port,
            database = config.database.as_deref().unwrap_or("<server>"),
            "connected to MySQL instance"
        );

        let strict_database = config
            .strict_database
            .then(|| config.database.clone())
            .flatten();
        let database = config.database.clone();
        Ok(Self {
            strict_database,
            state: RwLock::new(ActiveState { pool, database }),
            history_pool: RwLock::new(None),
            namespace_locks: Mutex::new(HashMap::new()),
            config,
        })
    }

    fn build_opts(config: &ConnectionConfig, database: Option<&str>) -> Opts {
        let mut builder = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.username.clone()))
            .pass((!config.password.is_empty()).then(|| config.password.clone()))
            .db_name(database.map(str::to_string));

        if let Some(ca) = &config.tls.ssl_ca {
            let ssl = SslOpts::default().with_root_certs(vec![std::path::PathBuf::from(ca).into()]);
            builder = builder.ssl_opts(ssl);
        }
        if config.read_only {
            builder = builder.init(vec!["SET SESSION TRANSACTION READ ONLY".to_string()]);
        }
        Opts::from(builder)
    }

    async fn conn(&self) -> Result<Conn> {
        let state = self.state.read().await;
        state.pool.get_conn().await.map_err(map_mysql_error)
    }

    /// The database hosting `migration_history`.
    fn history_database(&self) -> &str {
        self.strict_database.as_deref().unwrap_or(INTERNAL_DATABASE)
    }

    async fn history_conn(&self) -> Result<Conn> {
        {
            let pool = self.history_pool.read().await;
            if let Some(pool) = pool.as_ref() {
                return pool.get_conn().await.map_err(map_mysql_error);
            }
        }
        let mut slot = self.history_pool.write().await;
        if slot.is_none() {
            *slot = Some(Pool::new(Self::build_opts(
                &self.config,
                Some(self.history_database()),
            )));
        }
        slot.as_ref().unwrap().get_conn().await.map_err(map_mysql_error)
    }

    async fn get_database_names(&self) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let names: Vec<String> = conn
            .query("SELECT SCHEMA_NAME FROM information_schema.SCHEMATA")
            .await?;
        Ok(names)
    }

    async fn has_internal_database(&self) -> Result<bool> {
        Ok(self
            .get_database_names()
            .await?
            .iter()
            .any(|name| name == INTERNAL_DATABASE))
    }

    fn namespace_lock_name(namespace: &str) -> String {
        // GET_LOCK names are capped at 64 characters; hash the namespace.
        let digest = Sha256::digest(namespace.as_bytes());
        let mut hex = String::with_capacity(32);
        for byte in &digest[..16] {
            hex.push_str(&format!("{byte:02x}"));
        }
        format!("dbshift.migration.{hex}")
    }

    /// Dump one database as SQL text.
    async fn dump_one_database(
        &self,
        database: &str,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        schema_only: bool,
        include_use_directive: bool,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        let script =
            introspect::dump_database_text(&mut conn, database, schema_only, include_use_directive)
                .await?;
        out.write_all(script.as_bytes()).await?;
        Ok(())
    }
}

fn map_mysql_error(e: mysql_async::Error) -> DriverError {
    if let mysql_async::Error::Server(server) = &e {
        // 1045: access denied.
        if server.code == 1045 {
            return DriverError::Authentication(server.message.clone());
        }
    }
    if matches!(e, mysql_async::Error::Io(_)) {
        return DriverError::Connection(e.to_string());
    }
    DriverError::Mysql(e)
}

/// Render one MySQL value as JSON for ad-hoc query results.
fn value_to_json(value: mysql_async::Value) -> serde_json::Value {
    use mysql_async::Value;
    match value {
        Value::NULL => serde_json::Value::Null,
        Value::Bytes(bytes) => serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Int(i) => serde_json::Value::from(i),
        Value::UInt(u) => serde_json::Value::from(u),
        Value::Float(f) => serde_json::Value::from(f),
        Value::Double(d) => serde_json::Value::from(d),
        other => serde_json::Value::String(other.as_sql(true)),
    }
}

#[async_trait]
impl Driver for MysqlDriver {
    fn engine_type(&self) -> EngineType {
        EngineType::Mysql
    }

    async fn close(&self) -> Result<()> {
        self.namespace_locks.lock().await.clear();
        let pool = self.state.read().await.pool.clone();
        pool.disconnect().await.map_err(map_mysql_error)?;
        let history = self.history_pool.read().await.clone();
        if let Some(pool) = history {
            pool.disconnect().await.map_err(map_mysql_error)?;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.ping().await.map_err(map_mysql_error)
    }

    async fn get_version(&self) -> Result<String> {
        let mut conn = self.conn().await?;
        let version: Option<String> = conn.query_first("SELECT VERSION()").await?;
        version.ok_or_else(|| DriverError::Internal("SELECT VERSION() returned no rows".to_string()))
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
        let pool = Pool::new(Self::build_opts(&self.config, Some(database)));
        let old = std::mem::replace(&mut state.pool, pool);
        state.database = Some(database.to_string());
        drop(state);
        if let Err(e) = old.disconnect().await {
            warn!(error = %e, "failed to drain replaced MySQL pool");
        }
        Ok(())
    }

    /// Execute a multi-statement script in one transaction.
    ///
    /// MySQL DDL commits implicitly, so a mid-script failure can leave
    /// earlier DDL applied; the transaction protects DML only.
    async fn execute(&self, statement: &str) -> Result<()> {
        let statements = StatementSplitter::new(EngineType::Mysql).split(statement);
        if statements.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn().await?;
        let mut tx = conn
            .start_transaction(TxOpts::default())
            .await
            .map_err(map_mysql_error)?;
        for stmt in &statements {
            tx.query_drop(stmt)
                .await
                .map_err(|e| map_mysql_error(e).with_statement(stmt))?;
        }
        tx.commit().await.map_err(map_mysql_error)?;
        Ok(())
    }

    async fn query(&self, statement: &str, limit: usize) -> Result<QueryResult> {
        let mut conn = self.conn().await?;
        let mut query_result = conn
            .query_iter(statement)
            .await
            .map_err(|e| map_mysql_error(e).with_statement(statement))?;

        let columns = query_result
            .columns()
            .map(|cols| cols.iter().map(|c| c.name_str().into_owned()).collect())
            .unwrap_or_default();
        let rows: Vec<mysql_async::Row> = query_result.collect().await.map_err(map_mysql_error)?;

        let mut result = QueryResult {
            columns,
            rows: Vec::new(),
        };
        for row in rows {
            if limit > 0 && result.rows.len() >= limit {
                break;
            }
            result
                .rows
                .push(row.unwrap().into_iter().map(value_to_json).collect());
        }
        Ok(result)
    }

    async fn sync_schema(&self) -> Result<(Vec<InstanceUser>, Vec<DatabaseSchema>)> {
        let mut conn = self.conn().await?;
        let users = introspect::get_user_list(&mut conn).await?;
        let databases = introspect::get_databases(&mut conn).await?;

        let mut schemas = Vec::new();
        for (name, character_set, collation) in databases {
            if SYSTEM_DATABASES.contains(&name.as_str()) || name == INTERNAL_DATABASE {
                continue;
            }
            if let Some(strict) = &self.strict_database {
                if &name != strict {
                    continue;
                }
            }

            let mut schema = DatabaseSchema {
                tables: introspect::get_tables(&mut conn, &name).await?,
                views: introspect::get_views(&mut conn, &name).await?,
                extensions: Vec::new(),
                name,
                character_set,
                collation,
            };
            schema.normalize();
            debug!(
                database = %schema.name,
                tables = schema.tables.len(),
                "synced database schema"
            );
            schemas.push(schema);
        }

        Ok((users, schemas))
    }

    async fn needs_setup_migration(&self) -> Result<bool> {
        if self.strict_database.is_none() && !self.has_internal_database().await? {
            return Ok(true);
        }

        let mut conn = self.conn().await?;
        let row: Option<i32> = conn
            .exec_first(
                "SELECT 1 FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = 'migration_history'",
                (self.history_database(),),
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

        if self.strict_database.is_none() && !self.has_internal_database().await? {
            let mut conn = self.conn().await?;
            conn.query_drop(format!("CREATE DATABASE `{INTERNAL_DATABASE}`"))
                .await
                .map_err(map_mysql_error)?;
        }

        let mut conn = self.history_conn().await?;
        for stmt in StatementSplitter::new(EngineType::Mysql).split(MIGRATION_SCHEMA) {
            conn.query_drop(&stmt)
                .await
                .map_err(|e| map_mysql_error(e).with_statement(&stmt))?;
        }
        info!("provisioned migration history storage");
        Ok(())
    }

    async fn execute_migration(
        &self,
        info: &MigrationInfo,
        statement: &str,
        cancel: &CancellationToken,
    ) -> Result<(i64, String)> {
        self.use_database(&info.namespace).await?;
        executor::execute_migration(self, info, statement, cancel).await
    }

    async fn find_migration_history(
        &self,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut params: Vec<mysql_async::Value> = Vec::new();
        if let Some(id) = find.id {
            conditions.push("id = ?");
            params.push(id.into());
        }
        if let Some(namespace) = &find.namespace {
            conditions.push("namespace = ?");
            params.push(namespace.clone().into());
        }
        if let Some(version) = &find.version {
            conditions.push("version = ?");
            params.push(to_stored_version(false, version, "")?.into());
        }
        if let Some(source) = find.source {
            conditions.push("source = ?");
            params.push(source.as_str().into());
        }

        let mut query = String::from(
            "SELECT id, created_by, created_ts, updated_by, updated_ts, release_version, \
             namespace, sequence, source, type, status, version, description, statement, \
             `schema`, schema_prev, execution_duration_ns, issue_id, payload \
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

        match self.list_history(&query, params.clone()).await {
            Err(DriverError::InvalidStoredVersion(_)) => {
                self.backfill_stored_versions().await?;
                self.list_history(&query, params).await
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
        let names = self.get_database_names().await?;
        let dumpable: Vec<String> = match database {
            Some(name) => {
                if !names.iter().any(|n| n == name) {
                    return Err(DriverError::Internal(format!("database {name:?} not found")));
                }
                vec![name.to_string()]
            }
            None => names
                .into_iter()
                .filter(|n| !SYSTEM_DATABASES.contains(&n.as_str()))
                .collect(),
        };

        let include_use = dumpable.len() > 1;
        for name in dumpable {
            if cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            self.dump_one_database(&name, out, schema_only, include_use)
                .await?;
        }
        Ok(())
    }

    async fn restore(&self, script: &str) -> Result<()> {
        self.execute(script).await
    }
}

impl MysqlDriver {
    async fn list_history(
        &self,
        query: &str,
        params: Vec<mysql_async::Value>,
    ) -> Result<Vec<MigrationHistory>> {
        let mut conn = self.history_conn().await?;
        let rows: Vec<mysql_async::Row> = if params.is_empty() {
            conn.query(query).await?
        } else {
            conn.exec(query, params).await?
        };

        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            let stored: String = row
                .get(11)
                .ok_or_else(|| DriverError::Internal("missing version column".to_string()))?;
            let (_, version, _) = from_stored_version(&stored)?;
            let source: String = row.get(8).unwrap_or_default();
            let migration_type: String = row.get(9).unwrap_or_default();
            let status: String = row.get(10).unwrap_or_default();
            history.push(MigrationHistory {
                id: row.get(0).unwrap_or_default(),
                creator: row.get(1).unwrap_or_default(),
                created_ts: row.get(2).unwrap_or_default(),
                updater: row.get(3).unwrap_or_default(),
                updated_ts: row.get(4).unwrap_or_default(),
                release_version: row.get(5).unwrap_or_default(),
                namespace: row.get(6).unwrap_or_default(),
                sequence: row.get(7).unwrap_or_default(),
                source: MigrationSource::parse(&source)?,
                migration_type: MigrationType::parse(&migration_type)?,
                status: MigrationStatus::parse(&status)?,
                version,
                description: row.get(12).unwrap_or_default(),
                statement: row.get(13).unwrap_or_default(),
                schema: row.get(14).unwrap_or_default(),
                schema_prev: row.get(15).unwrap_or_default(),
                execution_duration_ns: row.get(16).unwrap_or_default(),
                issue_id: row.get(17).unwrap_or_default(),
                payload: row.get(18).unwrap_or_default(),
            });
        }
        Ok(history)
    }

    async fn backfill_stored_versions(&self) -> Result<()> {
        let mut conn = self.history_conn().await?;
        let rows: Vec<(i64, String)> = conn
            .query("SELECT id, version FROM migration_history")
            .await?;

        let mut updated = 0u64;
        for (id, version) in rows {
            if from_stored_version(&version).is_ok() {
                continue;
            }
            let new_version = format!("{NON_SEMANTIC_PREFIX}{version}");
            conn.exec_drop(
                "UPDATE migration_history SET version = ? WHERE id = ? AND version = ?",
                (new_version, id, version),
            )
            .await?;
            updated += 1;
        }
        info!(updated, "backfilled legacy migration history versions");
        Ok(())
    }
}

#[async_trait]
impl HistoryExecutor for MysqlDriver {
    async fn lock_namespace(&self, namespace: &str) -> Result<()> {
        let mut conn = self.history_conn().await?;
        let name = Self::namespace_lock_name(namespace);
        let row: Option<mysql_async::Row> = conn
            .exec_first("SELECT GET_LOCK(?, ?)", (&name, LOCK_TIMEOUT_SECS))
            .await?;
        let acquired = row
            .and_then(|r| r.get::<Option<i32>, _>(0))
            .flatten()
            .unwrap_or(0);
        if acquired != 1 {
            return Err(DriverError::Internal(format!(
                "timed out acquiring migration lock for namespace {namespace:?}"
            )));
        }
        self.namespace_locks
            .lock()
            .await
            .insert(namespace.to_string(), conn);
        Ok(())
    }

    async fn unlock_namespace(&self, namespace: &str) -> Result<()> {
        let conn = self.namespace_locks.lock().await.remove(namespace);
        let Some(mut conn) = conn else {
            warn!(namespace, "unlock without a held advisory lock");
            return Ok(());
        };
        let name = Self::namespace_lock_name(namespace);
        conn.exec_drop("SELECT RELEASE_LOCK(?)", (name,)).await?;
        Ok(())
    }

    async fn find_largest_version_since_baseline(
        &self,
        namespace: &str,
    ) -> Result<Option<String>> {
        let largest_baseline_sequence = self.find_largest_sequence(namespace, true).await?;
        let mut conn = self.history_conn().await?;
        let version: Option<Option<String>> = conn
            .exec_first(
                "SELECT MAX(version) FROM migration_history \
                 WHERE namespace = ? AND sequence >= ? AND status != 'FAILED'",
                (namespace, largest_baseline_sequence),
            )
            .await?;
        Ok(version.flatten())
    }

    async fn find_largest_sequence(&self, namespace: &str, baseline_only: bool) -> Result<i64> {
        let mut query =
            String::from("SELECT MAX(sequence) FROM migration_history WHERE namespace = ?");
        if baseline_only {
            query.push_str(" AND (type = 'BASELINE' OR type = 'BRANCH')");
        }
        let mut conn = self.history_conn().await?;
        let sequence: Option<Option<i64>> = conn.exec_first(&query, (namespace,)).await?;
        Ok(sequence.flatten().unwrap_or(0))
    }

    async fn insert_pending_history(
        &self,
        sequence: i64,
        prev_schema: &str,
        info: &MigrationInfo,
        stored_version: &str,
        statement: &str,
    ) -> Result<i64> {
        let mut conn = self.history_conn().await?;
        conn.exec_drop(
            "INSERT INTO migration_history (\
             created_by, created_ts, updated_by, updated_ts, release_version, namespace, \
             sequence, source, type, status, version, description, statement, `schema`, \
             schema_prev, execution_duration_ns, issue_id, payload) \
             VALUES (:created_by, UNIX_TIMESTAMP(), :updated_by, UNIX_TIMESTAMP(), \
             :release_version, :namespace, :sequence, :source, :type, 'PENDING', :version, \
             :description, :statement, :schema, :schema_prev, 0, :issue_id, :payload)",
            params! {
                "created_by" => &info.creator,
                "updated_by" => &info.creator,
                "release_version" => &info.release_version,
                "namespace" => &info.namespace,
                "sequence" => sequence,
                "source" => info.source.as_str(),
                "type" => info.migration_type.as_str(),
                "version" => stored_version,
                "description" => &info.description,
                "statement" => statement,
                "schema" => prev_schema,
                "schema_prev" => prev_schema,
                "issue_id" => &info.issue_id,
                "payload" => &info.payload,
            },
        )
        .await?;

        conn.last_insert_id()
            .map(|id| id as i64)
            .ok_or_else(|| DriverError::Internal("no insert id for pending history".to_string()))
    }

    async fn update_history_as_done(
        &self,
        duration_ns: i64,
        updated_schema: &str,
        id: i64,
    ) -> Result<()> {
        let mut conn = self.history_conn().await?;
        conn.exec_drop(
            "UPDATE migration_history SET status = 'DONE', updated_ts = UNIX_TIMESTAMP(), \
             execution_duration_ns = ?, `schema` = ? WHERE id = ?",
            (duration_ns, updated_schema, id),
        )
        .await?;
        Ok(())
    }

    async fn update_history_as_failed(&self, duration_ns: i64, id: i64) -> Result<()> {
        let mut conn = self.history_conn().await?;
        conn.exec_drop(
            "UPDATE migration_history SET status = 'FAILED', updated_ts = UNIX_TIMESTAMP(), \
             execution_duration_ns = ? WHERE id = ?",
            (duration_ns, id),
        )
        .await?;
        Ok(())
    }

    async fn update_stale_pending_as_failed(&self, older_than: Duration) -> Result<u64> {
        let cutoff_secs = i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX);
        let mut conn = self.history_conn().await?;
        conn.exec_drop(
            "UPDATE migration_history SET status = 'FAILED', updated_ts = UNIX_TIMESTAMP() \
             WHERE status = 'PENDING' AND created_ts < UNIX_TIMESTAMP() - ?",
            (cutoff_secs,),
        )
        .await?;
        Ok(conn.affected_rows())
    }

    async fn execute_statement(&self, statement: &str) -> Result<()> {
        Driver::execute(self, statement).await
    }

    async fn dump_database_schema(&self, database: &str) -> Result<String> {
        let mut conn = self.conn().await?;
        introspect::dump_database_text(&mut conn, database, true, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_name_is_stable_and_bounded() {
        let a = MysqlDriver::namespace_lock_name("app");
        let b = MysqlDriver::namespace_lock_name("app");
        assert_eq!(a, b);
        assert!(a.len() <= 64);
        assert_ne!(a, MysqlDriver::namespace_lock_name("other"));
    }

    #[test]
    fn value_to_json_renders_scalars() {
        use mysql_async::Value;
        assert_eq!(value_to_json(Value::NULL), serde_json::Value::Null);
        assert_eq!(
            value_to_json(Value::Bytes(b"hello".to_vec())),
            serde_json::Value::String("hello".into())
        );
        assert_eq!(value_to_json(Value::Int(-3)), serde_json::Value::from(-3));
        assert_eq!(value_to_json(Value::UInt(7)), serde_json::Value::from(7u64));
    }
}
