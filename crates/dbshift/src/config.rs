//! Connection configuration shared by all engine drivers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// TLS material for an engine connection.
///
/// All fields are filesystem paths to PEM files. `ssl_cert` and `ssl_key`
/// must be both present or both absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsMaterial {
    /// Root CA certificate used to verify the server.
    #[serde(default)]
    pub ssl_ca: Option<String>,
    /// Client certificate for mutual TLS.
    #[serde(default)]
    pub ssl_cert: Option<String>,
    /// Client private key for mutual TLS.
    #[serde(default)]
    pub ssl_key: Option<String>,
}

impl TlsMaterial {
    /// Validate the cert/key pairing invariant.
    pub fn validate(&self) -> Result<()> {
        if self.ssl_cert.is_some() != self.ssl_key.is_some() {
            return Err(DriverError::Config(
                "ssl-cert and ssl-key must be both set or unset".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether any TLS material was supplied.
    pub fn is_enabled(&self) -> bool {
        self.ssl_ca.is_some()
    }
}

/// Connection configuration for an engine instance.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Engine host.
    pub host: String,

    /// Engine port.
    pub port: u16,

    /// Login role.
    pub username: String,

    /// Login password.
    #[serde(default)]
    pub password: String,

    /// Target database. Optional; PostgreSQL discovers one when absent.
    #[serde(default)]
    pub database: Option<String>,

    /// TLS material (root CA, optional client identity).
    #[serde(default)]
    pub tls: TlsMaterial,

    /// Force read-only transactions where the engine supports it.
    #[serde(default)]
    pub read_only: bool,

    /// Confine the driver to `database` and never create or switch to the
    /// internal history database.
    #[serde(default)]
    pub strict_database: bool,
}

impl ConnectionConfig {
    /// Validate invariants that hold for every engine.
    pub fn validate(&self) -> Result<()> {
        self.tls.validate()?;
        if self.strict_database && self.database.is_none() {
            return Err(DriverError::Config(
                "strict database mode requires a database name".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("tls", &self.tls)
            .field("read_only", &self.read_only)
            .field("strict_database", &self.strict_database)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ConnectionConfig {
        ConnectionConfig {
            host: "localhost".into(),
            port: 5432,
            username: "admin".into(),
            password: "secret".into(),
            database: None,
            tls: TlsMaterial::default(),
            read_only: false,
            strict_database: false,
        }
    }

    #[test]
    fn tls_cert_and_key_must_pair() {
        let mut config = base_config();
        config.tls.ssl_cert = Some("/tmp/client.crt".into());
        assert!(config.validate().is_err());

        config.tls.ssl_key = Some("/tmp/client.key".into());
        assert!(config.validate().is_ok());

        config.tls.ssl_cert = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn strict_mode_requires_database() {
        let mut config = base_config();
        config.strict_database = true;
        assert!(config.validate().is_err());

        config.database = Some("app".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn debug_redacts_password() {
        let rendered = format!("{:?}", base_config());
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("secret"));
    }
}
