//! Migration descriptors, history records and filename parsing.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Where a migration originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationSource {
    Ui,
    Vcs,
}

impl MigrationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationSource::Ui => "UI",
            MigrationSource::Vcs => "VCS",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "UI" => Ok(MigrationSource::Ui),
            "VCS" => Ok(MigrationSource::Vcs),
            other => Err(DriverError::Internal(format!(
                "invalid migration source {other:?}"
            ))),
        }
    }
}

/// What kind of history record a migration produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationType {
    /// Establish a starting schema snapshot without applying user SQL.
    Baseline,
    /// Apply user SQL under version discipline.
    Migrate,
    /// Fork the version lineage; resets the since-baseline window.
    Branch,
}

impl MigrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationType::Baseline => "BASELINE",
            MigrationType::Migrate => "MIGRATE",
            MigrationType::Branch => "BRANCH",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "BASELINE" => Ok(MigrationType::Baseline),
            "MIGRATE" => Ok(MigrationType::Migrate),
            "BRANCH" => Ok(MigrationType::Branch),
            other => Err(DriverError::Internal(format!(
                "invalid migration type {other:?}"
            ))),
        }
    }
}

/// Lifecycle state of a history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    Pending,
    Done,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "PENDING",
            MigrationStatus::Done => "DONE",
            MigrationStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(MigrationStatus::Pending),
            "DONE" => Ok(MigrationStatus::Done),
            "FAILED" => Ok(MigrationStatus::Failed),
            other => Err(DriverError::Internal(format!(
                "invalid migration status {other:?}"
            ))),
        }
    }
}

/// Descriptor for one migration attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationInfo {
    /// Principal that initiated the migration.
    pub creator: String,
    /// Version of the service that ran it.
    pub release_version: String,
    /// Target database name; sequence and version monotonicity are scoped
    /// to it.
    pub namespace: String,
    pub source: MigrationSource,
    pub migration_type: MigrationType,
    /// Raw version string as the user supplied it.
    pub version: String,
    /// Whether `version` is a semantic `major.minor.patch` triple.
    pub use_semantic_version: bool,
    /// Suffix stored alongside semantic versions to keep them unique.
    pub semantic_version_suffix: String,
    pub description: String,
    pub issue_id: String,
    /// Opaque payload recorded verbatim with the history row.
    pub payload: String,
}

/// One append-only history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationHistory {
    pub id: i64,
    pub creator: String,
    /// Seconds since epoch.
    pub created_ts: i64,
    pub updater: String,
    /// Seconds since epoch.
    pub updated_ts: i64,
    pub release_version: String,
    pub namespace: String,
    /// Monotone per namespace, contiguous from 1.
    pub sequence: i64,
    pub source: MigrationSource,
    pub migration_type: MigrationType,
    pub status: MigrationStatus,
    /// Decoded (raw) version string.
    pub version: String,
    pub description: String,
    /// The executed statement, verbatim.
    pub statement: String,
    /// Schema snapshot after the attempt.
    pub schema: String,
    /// Schema snapshot of the previous `DONE` row, or empty.
    pub schema_prev: String,
    pub execution_duration_ns: i64,
    pub issue_id: String,
    pub payload: String,
}

/// Filter for history queries. Results are ordered by `created_ts` descending.
#[derive(Debug, Clone, Default)]
pub struct MigrationHistoryFind {
    pub id: Option<i64>,
    pub namespace: Option<String>,
    /// Raw version; encoded to stored form before querying.
    pub version: Option<String>,
    pub source: Option<MigrationSource>,
    pub limit: Option<usize>,
}

/// A migration descriptor parsed from a pushed filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMigrationFile {
    pub version: String,
    pub use_semantic_version: bool,
    pub description: String,
}

static MIGRATION_FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<version>\d+(?:\.\d+\.\d+)?)__(?P<description>.+)\.sql$").unwrap());

/// Parse `<version>__<description>.sql`.
///
/// `version` is either a plain integer or a `major.minor.patch` triple;
/// underscores in the description become spaces. The failure is user-visible;
/// callers skip the file and log.
pub fn parse_migration_filename(filename: &str) -> Result<ParsedMigrationFile> {
    let captures = MIGRATION_FILENAME_RE.captures(filename).ok_or_else(|| {
        DriverError::Config(format!(
            "invalid migration filename {filename:?}: expected <version>__<description>.sql"
        ))
    })?;
    let version = captures["version"].to_string();
    let description = captures["description"].replace('_', " ");
    Ok(ParsedMigrationFile {
        use_semantic_version: version.contains('.'),
        version,
        description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_integer_version_filename() {
        let parsed = parse_migration_filename("0004__add_col.sql").unwrap();
        assert_eq!(parsed.version, "0004");
        assert!(!parsed.use_semantic_version);
        assert_eq!(parsed.description, "add col");
    }

    #[test]
    fn parses_semantic_version_filename() {
        let parsed = parse_migration_filename("1.2.3__create_orders_table.sql").unwrap();
        assert_eq!(parsed.version, "1.2.3");
        assert!(parsed.use_semantic_version);
        assert_eq!(parsed.description, "create orders table");
    }

    #[test]
    fn rejects_non_sql_and_malformed_names() {
        assert!(parse_migration_filename("README.md").is_err());
        assert!(parse_migration_filename("add_col.sql").is_err());
        assert!(parse_migration_filename("0004_add_col.sql").is_err());
        assert!(parse_migration_filename("0004__.sql").is_err());
    }

    #[test]
    fn status_codec_round_trips() {
        for status in [
            MigrationStatus::Pending,
            MigrationStatus::Done,
            MigrationStatus::Failed,
        ] {
            assert_eq!(MigrationStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(MigrationStatus::parse("RUNNING").is_err());
    }

    #[test]
    fn type_and_source_codecs_round_trip() {
        for ty in [
            MigrationType::Baseline,
            MigrationType::Migrate,
            MigrationType::Branch,
        ] {
            assert_eq!(MigrationType::parse(ty.as_str()).unwrap(), ty);
        }
        for source in [MigrationSource::Ui, MigrationSource::Vcs] {
            assert_eq!(MigrationSource::parse(source.as_str()).unwrap(), source);
        }
    }
}
