//! Engine driver implementations.
//!
//! - [`postgres`]: PostgreSQL driver (pooled tokio-postgres, pg_dump export)
//! - [`mysql`]: MySQL driver (mysql_async)
//! - [`common`]: shared TLS plumbing

pub mod common;
pub mod mysql;
pub mod postgres;
