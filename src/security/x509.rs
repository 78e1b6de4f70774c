//! Certificate loading for OPC UA client authentication.
//!
//! Certificate generation and validation are external collaborators, not
//! something this bridge implements (the `opcua` client itself reads and
//! validates the PEM/DER bytes once a security policy other than `None` is
//! configured). `CertificateManager` is the narrow surface the Connection
//! Pool actually needs: resolved paths, checked for existence at startup so
//! a missing certificate fails fast instead of surfacing as an opaque
//! handshake error from inside the first `connect_to_endpoint` call.

use crate::config::SecurityConfig;
use crate::errors::{BridgeError, BridgeResult};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct CertificateManager {
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
    trusted_server_certs_dir: Option<PathBuf>,
}

impl CertificateManager {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            client_cert_path: config.client_certificate_path.as_ref().map(PathBuf::from),
            client_key_path: config.client_private_key_path.as_ref().map(PathBuf::from),
            trusted_server_certs_dir: config.trusted_server_certs_dir.as_ref().map(PathBuf::from),
        }
    }

    pub fn client_cert_path(&self) -> Option<&Path> {
        self.client_cert_path.as_deref()
    }

    pub fn client_key_path(&self) -> Option<&Path> {
        self.client_key_path.as_deref()
    }

    pub fn trusted_server_certs_dir(&self) -> Option<&Path> {
        self.trusted_server_certs_dir.as_deref()
    }

    /// Verifies the configured certificate/key pair exist on disk. An
    /// unconfigured certificate is not an error (the bridge falls back to
    /// `SecurityPolicy::None` per endpoint); a configured certificate
    /// missing its key, or missing from disk, is fatal at startup.
    pub async fn load_certificates(&self) -> BridgeResult<()> {
        let Some(cert_path) = &self.client_cert_path else {
            warn!("no_client_certificate_configured");
            return Ok(());
        };

        if !tokio::fs::try_exists(cert_path).await.unwrap_or(false) {
            return Err(BridgeError::Security(format!(
                "client certificate not found: {}",
                cert_path.display()
            )));
        }

        let Some(key_path) = &self.client_key_path else {
            return Err(BridgeError::Security(
                "client certificate configured without a matching private key".to_string(),
            ));
        };

        if !tokio::fs::try_exists(key_path).await.unwrap_or(false) {
            return Err(BridgeError::Security(format!(
                "client private key not found: {}",
                key_path.display()
            )));
        }

        info!(cert = %cert_path.display(), "certificates_loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_certificate_is_not_fatal_when_unconfigured() {
        let config = SecurityConfig::default();
        let manager = CertificateManager::new(&config);
        assert!(manager.load_certificates().await.is_ok());
    }

    #[tokio::test]
    async fn configured_but_missing_certificate_is_fatal() {
        let config = SecurityConfig {
            client_certificate_path: Some("/nonexistent/client.pem".to_string()),
            ..SecurityConfig::default()
        };
        let manager = CertificateManager::new(&config);
        assert!(manager.load_certificates().await.is_err());
    }
}
