//! The generic migration executor.
//!
//! Polymorphic over the [`HistoryExecutor`] capability set: every engine
//! driver delegates its `execute_migration` here and contributes only the
//! storage and execution primitives.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::driver::HistoryExecutor;
use crate::error::{DriverError, Result};
use crate::migration::{MigrationInfo, MigrationType};
use crate::version::to_stored_version;

/// Execute one migration attempt under history discipline.
///
/// Serializes on the namespace advisory lock, rejects duplicate versions,
/// allocates the next sequence, inserts a `PENDING` row, runs the statement
/// and finalizes the row exactly once as `DONE` or `FAILED`. Returns the
/// history row id and the post-execution schema dump.
pub async fn execute_migration<E: HistoryExecutor + ?Sized>(
    executor: &E,
    info: &MigrationInfo,
    statement: &str,
    cancel: &CancellationToken,
) -> Result<(i64, String)> {
    executor.lock_namespace(&info.namespace).await?;
    let result = execute_locked(executor, info, statement, cancel).await;
    if let Err(e) = executor.unlock_namespace(&info.namespace).await {
        warn!(namespace = %info.namespace, error = %e, "failed to release namespace lock");
    }
    result
}

async fn execute_locked<E: HistoryExecutor + ?Sized>(
    executor: &E,
    info: &MigrationInfo,
    statement: &str,
    cancel: &CancellationToken,
) -> Result<(i64, String)> {
    let stored_version = to_stored_version(
        info.use_semantic_version,
        &info.version,
        &info.semantic_version_suffix,
    )?;

    // Reject any version at or below the largest non-failed version since the
    // last baseline/branch. Baselines reset the window, so they skip the check.
    if info.migration_type != MigrationType::Baseline {
        if let Some(largest) = executor
            .find_largest_version_since_baseline(&info.namespace)
            .await?
        {
            if largest >= stored_version {
                return Err(DriverError::MigrationAlreadyApplied {
                    namespace: info.namespace.clone(),
                    version: info.version.clone(),
                });
            }
        }
    }

    let sequence = executor
        .find_largest_sequence(&info.namespace, false)
        .await?
        + 1;

    let prev_schema = executor.dump_database_schema(&info.namespace).await?;

    let history_id = executor
        .insert_pending_history(sequence, &prev_schema, info, &stored_version, statement)
        .await?;
    let started = Instant::now();

    // A baseline only records the snapshot; user SQL is not executed.
    let outcome = if info.migration_type == MigrationType::Baseline {
        Ok(prev_schema.clone())
    } else {
        run_statement(executor, info, statement, cancel).await
    };

    let duration_ns = elapsed_ns(started);
    match outcome {
        Ok(updated_schema) => {
            executor
                .update_history_as_done(duration_ns, &updated_schema, history_id)
                .await?;
            info!(
                namespace = %info.namespace,
                version = %info.version,
                sequence,
                duration_ns,
                "migration done"
            );
            Ok((history_id, updated_schema))
        }
        Err(e) => {
            executor
                .update_history_as_failed(duration_ns, history_id)
                .await?;
            warn!(
                namespace = %info.namespace,
                version = %info.version,
                error = %e,
                "migration failed"
            );
            Err(e.with_statement(statement))
        }
    }
}

/// Run the user statement, racing against cancellation, then capture the
/// post-execution schema.
async fn run_statement<E: HistoryExecutor + ?Sized>(
    executor: &E,
    info: &MigrationInfo,
    statement: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    tokio::select! {
        _ = cancel.cancelled() => return Err(DriverError::Cancelled),
        result = executor.execute_statement(statement) => result?,
    }
    executor.dump_database_schema(&info.namespace).await
}

fn elapsed_ns(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_nanos()).unwrap_or(i64::MAX)
}

/// Promote `PENDING` rows older than `older_than` to `FAILED`.
///
/// Crash recovery for attempts that never reached a terminal update.
pub async fn reap_stale_pending<E: HistoryExecutor + ?Sized>(
    executor: &E,
    older_than: Duration,
) -> Result<u64> {
    let reaped = executor.update_stale_pending_as_failed(older_than).await?;
    if reaped > 0 {
        warn!(reaped, "promoted stale pending migrations to failed");
    }
    Ok(reaped)
}

/// Run [`reap_stale_pending`] on `interval` until `cancel` fires.
pub async fn run_pending_reaper<E: HistoryExecutor + ?Sized>(
    executor: &E,
    interval: Duration,
    older_than: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = reap_stale_pending(executor, older_than).await {
                    warn!(error = %e, "pending reaper pass failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::migration::{MigrationSource, MigrationStatus};

    #[derive(Debug, Clone)]
    struct FakeRow {
        id: i64,
        namespace: String,
        sequence: i64,
        migration_type: MigrationType,
        status: MigrationStatus,
        stored_version: String,
        schema: String,
        schema_prev: String,
        duration_ns: i64,
    }

    #[derive(Default)]
    struct FakeHistory {
        rows: Mutex<Vec<FakeRow>>,
        executed: Mutex<Vec<String>>,
        next_id: AtomicI64,
        lock_depth: AtomicI64,
    }

    impl FakeHistory {
        fn new() -> Self {
            Self {
                next_id: AtomicI64::new(1),
                ..Default::default()
            }
        }

        fn rows(&self) -> Vec<FakeRow> {
            self.rows.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HistoryExecutor for FakeHistory {
        async fn lock_namespace(&self, _namespace: &str) -> Result<()> {
            assert_eq!(self.lock_depth.fetch_add(1, Ordering::SeqCst), 0);
            Ok(())
        }

        async fn unlock_namespace(&self, _namespace: &str) -> Result<()> {
            assert_eq!(self.lock_depth.fetch_sub(1, Ordering::SeqCst), 1);
            Ok(())
        }

        async fn find_largest_version_since_baseline(
            &self,
            namespace: &str,
        ) -> Result<Option<String>> {
            let rows = self.rows.lock().unwrap();
            let baseline_seq = rows
                .iter()
                .filter(|r| {
                    r.namespace == namespace
                        && matches!(
                            r.migration_type,
                            MigrationType::Baseline | MigrationType::Branch
                        )
                })
                .map(|r| r.sequence)
                .max()
                .unwrap_or(0);
            Ok(rows
                .iter()
                .filter(|r| {
                    r.namespace == namespace
                        && r.sequence >= baseline_seq
                        && r.status != MigrationStatus::Failed
                })
                .map(|r| r.stored_version.clone())
                .max())
        }

        async fn find_largest_sequence(&self, namespace: &str, baseline_only: bool) -> Result<i64> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .filter(|r| r.namespace == namespace)
                .filter(|r| {
                    !baseline_only
                        || matches!(
                            r.migration_type,
                            MigrationType::Baseline | MigrationType::Branch
                        )
                })
                .map(|r| r.sequence)
                .max()
                .unwrap_or(0))
        }

        async fn insert_pending_history(
            &self,
            sequence: i64,
            prev_schema: &str,
            info: &MigrationInfo,
            stored_version: &str,
            _statement: &str,
        ) -> Result<i64> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.rows.lock().unwrap().push(FakeRow {
                id,
                namespace: info.namespace.clone(),
                sequence,
                migration_type: info.migration_type,
                status: MigrationStatus::Pending,
                stored_version: stored_version.to_string(),
                schema: prev_schema.to_string(),
                schema_prev: prev_schema.to_string(),
                duration_ns: 0,
            });
            Ok(id)
        }

        async fn update_history_as_done(
            &self,
            duration_ns: i64,
            updated_schema: &str,
            id: i64,
        ) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.iter_mut().find(|r| r.id == id).unwrap();
            assert_eq!(row.status, MigrationStatus::Pending);
            row.status = MigrationStatus::Done;
            row.schema = updated_schema.to_string();
            row.duration_ns = duration_ns;
            Ok(())
        }

        async fn update_history_as_failed(&self, duration_ns: i64, id: i64) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.iter_mut().find(|r| r.id == id).unwrap();
            assert_eq!(row.status, MigrationStatus::Pending);
            row.status = MigrationStatus::Failed;
            row.duration_ns = duration_ns;
            Ok(())
        }

        async fn update_stale_pending_as_failed(&self, _older_than: Duration) -> Result<u64> {
            let mut rows = self.rows.lock().unwrap();
            let mut reaped = 0;
            for row in rows.iter_mut() {
                if row.status == MigrationStatus::Pending {
                    row.status = MigrationStatus::Failed;
                    reaped += 1;
                }
            }
            Ok(reaped)
        }

        async fn execute_statement(&self, statement: &str) -> Result<()> {
            if statement.contains("1/0") {
                return Err(DriverError::Internal("division by zero".to_string()));
            }
            self.executed.lock().unwrap().push(statement.to_string());
            Ok(())
        }

        async fn dump_database_schema(&self, _database: &str) -> Result<String> {
            Ok(format!("snapshot-{}", self.executed.lock().unwrap().len()))
        }
    }

    fn info(ty: MigrationType, version: &str) -> MigrationInfo {
        MigrationInfo {
            creator: "tester".into(),
            release_version: "0.1.0".into(),
            namespace: "app".into(),
            source: MigrationSource::Ui,
            migration_type: ty,
            version: version.into(),
            use_semantic_version: false,
            semantic_version_suffix: String::new(),
            description: "test migration".into(),
            issue_id: String::new(),
            payload: String::new(),
        }
    }

    #[tokio::test]
    async fn baseline_then_migrate_produces_contiguous_done_rows() {
        let fake = FakeHistory::new();
        let cancel = CancellationToken::new();

        execute_migration(&fake, &info(MigrationType::Baseline, "0001"), "", &cancel)
            .await
            .unwrap();
        execute_migration(
            &fake,
            &info(MigrationType::Migrate, "0002"),
            "CREATE TABLE t(id INT);",
            &cancel,
        )
        .await
        .unwrap();

        let rows = fake.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sequence, 1);
        assert_eq!(rows[1].sequence, 2);
        assert!(rows.iter().all(|r| r.status == MigrationStatus::Done));
        // Baseline records schema == schema_prev and executes nothing.
        assert_eq!(rows[0].schema, rows[0].schema_prev);
        assert_eq!(fake.executed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_version_is_rejected_without_a_new_row() {
        let fake = FakeHistory::new();
        let cancel = CancellationToken::new();

        execute_migration(&fake, &info(MigrationType::Baseline, "0001"), "", &cancel)
            .await
            .unwrap();
        execute_migration(
            &fake,
            &info(MigrationType::Migrate, "0002"),
            "CREATE TABLE t(id INT);",
            &cancel,
        )
        .await
        .unwrap();

        let err = execute_migration(
            &fake,
            &info(MigrationType::Migrate, "0002"),
            "CREATE TABLE u(id INT);",
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DriverError::MigrationAlreadyApplied { .. }));
        assert_eq!(fake.rows().len(), 2);
    }

    #[tokio::test]
    async fn failing_statement_finalizes_row_as_failed_with_statement() {
        let fake = FakeHistory::new();
        let cancel = CancellationToken::new();

        execute_migration(&fake, &info(MigrationType::Baseline, "0001"), "", &cancel)
            .await
            .unwrap();
        let err = execute_migration(
            &fake,
            &info(MigrationType::Migrate, "0003"),
            "CREATE TABLE t(id INT); SELECT 1/0;",
            &cancel,
        )
        .await
        .unwrap_err();

        match err {
            DriverError::InvalidStatement { statement, .. } => {
                assert!(statement.contains("SELECT 1/0"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let rows = fake.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].status, MigrationStatus::Failed);
    }

    #[tokio::test]
    async fn failed_version_can_be_retried() {
        let fake = FakeHistory::new();
        let cancel = CancellationToken::new();

        execute_migration(
            &fake,
            &info(MigrationType::Migrate, "0001"),
            "SELECT 1/0;",
            &cancel,
        )
        .await
        .unwrap_err();

        // The failed attempt does not block the version from being reapplied.
        execute_migration(
            &fake,
            &info(MigrationType::Migrate, "0001"),
            "CREATE TABLE t(id INT);",
            &cancel,
        )
        .await
        .unwrap();

        let rows = fake.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, MigrationStatus::Failed);
        assert_eq!(rows[1].status, MigrationStatus::Done);
        assert_eq!(rows[1].sequence, 2);
    }

    #[tokio::test]
    async fn cancelled_migration_is_finalized_as_failed() {
        let fake = FakeHistory::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = execute_migration(
            &fake,
            &info(MigrationType::Migrate, "0001"),
            "CREATE TABLE t(id INT);",
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DriverError::Cancelled));
        let rows = fake.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, MigrationStatus::Failed);
    }

    #[tokio::test]
    async fn done_schema_prev_chains_to_previous_done_schema() {
        let fake = FakeHistory::new();
        let cancel = CancellationToken::new();

        execute_migration(
            &fake,
            &info(MigrationType::Migrate, "0001"),
            "CREATE TABLE a(id INT);",
            &cancel,
        )
        .await
        .unwrap();
        execute_migration(
            &fake,
            &info(MigrationType::Migrate, "0002"),
            "CREATE TABLE b(id INT);",
            &cancel,
        )
        .await
        .unwrap();

        let rows = fake.rows();
        assert_eq!(rows[1].schema_prev, rows[0].schema);
    }

    #[tokio::test]
    async fn reaper_promotes_pending_rows() {
        let fake = FakeHistory::new();
        fake.insert_pending_history(
            1,
            "",
            &info(MigrationType::Migrate, "0001"),
            "0000.0000.0000-0001",
            "SELECT 1;",
        )
        .await
        .unwrap();

        let reaped = reap_stale_pending(&fake, Duration::from_secs(0)).await.unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(fake.rows()[0].status, MigrationStatus::Failed);
    }
}
