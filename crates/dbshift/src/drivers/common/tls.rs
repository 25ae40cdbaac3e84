//! TLS configuration built from user-supplied PEM material.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::info;

use crate::config::TlsMaterial;
use crate::error::{DriverError, Result};

/// Builds rustls client configurations from [`TlsMaterial`].
///
/// Without a root CA the connection stays plain; some providers still perform
/// a server-side SSL probe, so the client never forcibly disables SSL either.
pub struct TlsBuilder<'a> {
    material: &'a TlsMaterial,
}

impl<'a> TlsBuilder<'a> {
    pub fn new(material: &'a TlsMaterial) -> Self {
        Self { material }
    }

    /// Build a connector for tokio-postgres. `None` means no TLS material was
    /// supplied and the caller should connect with `NoTls`.
    pub fn build_postgres(&self) -> Result<Option<MakeRustlsConnect>> {
        match self.build_client_config()? {
            Some(config) => Ok(Some(MakeRustlsConnect::new(config))),
            None => Ok(None),
        }
    }

    /// Build the underlying rustls client config, or `None` without a CA.
    pub fn build_client_config(&self) -> Result<Option<ClientConfig>> {
        self.material.validate()?;
        let Some(ca_path) = &self.material.ssl_ca else {
            return Ok(None);
        };

        let mut root_store = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            root_store.add(cert).map_err(|e| {
                DriverError::Config(format!("invalid root CA certificate in {ca_path}: {e}"))
            })?;
        }

        let builder = ClientConfig::builder().with_root_certificates(root_store);
        let config = match (&self.material.ssl_cert, &self.material.ssl_key) {
            (Some(cert_path), Some(key_path)) => {
                info!("client certificate authentication enabled");
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                builder.with_client_auth_cert(certs, key).map_err(|e| {
                    DriverError::Config(format!("invalid client certificate or key: {e}"))
                })?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(Some(config))
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| DriverError::Config(format!("cannot read certificate {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut reader).collect();
    let certs =
        certs.map_err(|e| DriverError::Config(format!("malformed certificate {path}: {e}")))?;
    if certs.is_empty() {
        return Err(DriverError::Config(format!(
            "no certificates found in {path}"
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(Path::new(path))
        .map_err(|e| DriverError::Config(format!("cannot read private key {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| DriverError::Config(format!("malformed private key {path}: {e}")))?
        .ok_or_else(|| DriverError::Config(format!("no private key found in {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_material_means_no_tls() {
        let material = TlsMaterial::default();
        let config = TlsBuilder::new(&material).build_client_config().unwrap();
        assert!(config.is_none());
    }

    #[test]
    fn missing_ca_file_is_a_config_error() {
        let material = TlsMaterial {
            ssl_ca: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        let err = TlsBuilder::new(&material).build_client_config().unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }

    #[test]
    fn half_present_client_identity_is_rejected() {
        let material = TlsMaterial {
            ssl_ca: Some("/nonexistent/ca.pem".into()),
            ssl_cert: Some("/nonexistent/client.pem".into()),
            ssl_key: None,
        };
        let err = TlsBuilder::new(&material).build_client_config().unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }
}
