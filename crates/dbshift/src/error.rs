//! Error types for the change-management engine.

use thiserror::Error;

/// Service-level error classification.
///
/// Drivers translate engine-specific failures into this taxonomy at their
/// boundary; the HTTP layer maps it onto status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    Conflict,
    Invalid,
    Unauthorized,
    Internal,
}

/// Main error type for driver and executor operations.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Could not establish or keep a connection to the engine.
    #[error("connection error: {0}")]
    Connection(String),

    /// The engine rejected the supplied credentials.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The operation is not supported by this engine.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A statement failed to parse or execute.
    #[error("invalid statement {statement:?}: {message}")]
    InvalidStatement { statement: String, message: String },

    /// A uniqueness or referential constraint was violated.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// A non-baseline migration targeted a version that is already applied.
    #[error("migration version {version} has already been applied to {namespace}")]
    MigrationAlreadyApplied { namespace: String, version: String },

    /// A history lookup named a (namespace, version) pair that does not exist.
    #[error("migration version {version} not found in {namespace}")]
    NamespaceVersionNotFound { namespace: String, version: String },

    /// A history row holds a version string not in the canonical stored form.
    ///
    /// Surfaced as its own variant so the one-time storage backfill can key on
    /// it instead of matching error text.
    #[error("invalid stored version {0:?}")]
    InvalidStoredVersion(String),

    /// Configuration error (bad URL, half-present TLS material, etc.)
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// PostgreSQL protocol or query error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// PostgreSQL connection pool error.
    #[error("postgres pool error: {0}")]
    PostgresPool(#[from] deadpool_postgres::PoolError),

    /// MySQL protocol or query error.
    #[error("mysql error: {0}")]
    Mysql(#[from] mysql_async::Error),

    /// IO error (pg_dump subprocess, PEM files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (query results, payloads).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DriverError {
    /// Create an `InvalidStatement` error carrying the offending statement.
    pub fn invalid_statement(statement: impl Into<String>, message: impl Into<String>) -> Self {
        DriverError::InvalidStatement {
            statement: statement.into(),
            message: message.into(),
        }
    }

    /// Wrap an engine error with the statement that produced it.
    ///
    /// Connection and authentication failures keep their own variant; query
    /// and protocol errors become `InvalidStatement` so callers always see
    /// what was being executed.
    pub fn with_statement(self, statement: &str) -> Self {
        match self {
            DriverError::Connection(_)
            | DriverError::Authentication(_)
            | DriverError::Cancelled
            | DriverError::InvalidStatement { .. } => self,
            other => DriverError::InvalidStatement {
                statement: statement.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Map this error onto the service-level taxonomy.
    pub fn classify(&self) -> ErrorClass {
        match self {
            DriverError::NamespaceVersionNotFound { .. } => ErrorClass::NotFound,
            DriverError::MigrationAlreadyApplied { .. }
            | DriverError::IntegrityViolation(_) => ErrorClass::Conflict,
            DriverError::InvalidStatement { .. }
            | DriverError::InvalidStoredVersion(_)
            | DriverError::NotSupported(_)
            | DriverError::Config(_) => ErrorClass::Invalid,
            DriverError::Authentication(_) => ErrorClass::Unauthorized,
            _ => ErrorClass::Internal,
        }
    }

    /// Format the error with its full source chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for driver and executor operations.
pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_driver_taxonomy_to_service_classes() {
        assert_eq!(
            DriverError::MigrationAlreadyApplied {
                namespace: "app".into(),
                version: "0002".into(),
            }
            .classify(),
            ErrorClass::Conflict
        );
        assert_eq!(
            DriverError::Authentication("bad password".into()).classify(),
            ErrorClass::Unauthorized
        );
        assert_eq!(
            DriverError::Connection("refused".into()).classify(),
            ErrorClass::Internal
        );
        assert_eq!(
            DriverError::NamespaceVersionNotFound {
                namespace: "app".into(),
                version: "9".into(),
            }
            .classify(),
            ErrorClass::NotFound
        );
    }

    #[test]
    fn with_statement_preserves_connection_errors() {
        let err = DriverError::Connection("refused".into()).with_statement("SELECT 1");
        assert!(matches!(err, DriverError::Connection(_)));

        let err = DriverError::Internal("oops".into()).with_statement("SELECT 1/0");
        match err {
            DriverError::InvalidStatement { statement, .. } => {
                assert_eq!(statement, "SELECT 1/0");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
