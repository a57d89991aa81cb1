//! rustls configuration for device sessions and the Name Authority listener

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{NetworkError, Result};

fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn read_pem(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| NetworkError::Tls(format!("failed to read {:?}: {}", path, e)))
}

/// Client-side TLS settings for outbound sessions
#[derive(Debug, Clone)]
pub struct ClientTls {
    pub config: Arc<rustls::ClientConfig>,
    /// Name presented in SNI and checked against the peer certificate
    pub server_name: String,
}

impl ClientTls {
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }

    pub fn server_name(&self) -> Result<rustls::pki_types::ServerName<'static>> {
        rustls::pki_types::ServerName::try_from(self.server_name.clone())
            .map_err(|e| NetworkError::Tls(format!("invalid server name: {}", e)))
    }
}

/// Build a server config (no client authentication) from PEM text
pub fn build_server_config(cert_pem: &str, key_pem: &str) -> Result<rustls::ServerConfig> {
    ensure_crypto_provider();
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| NetworkError::Tls(format!("parse server certs: {}", e)))?;
    if certs.is_empty() {
        return Err(NetworkError::Tls("no certificate found".to_string()));
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| NetworkError::Tls(format!("parse server key: {}", e)))?
        .ok_or_else(|| NetworkError::Tls("no private key found".to_string()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NetworkError::Tls(format!("build server config: {}", e)))
}

/// Build a client config trusting the CA certificates in `ca_pem`
pub fn build_client_config(ca_pem: &str) -> Result<rustls::ClientConfig> {
    ensure_crypto_provider();
    let mut root_store = rustls::RootCertStore::empty();
    let ca_certs = rustls_pemfile::certs(&mut ca_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| NetworkError::Tls(format!("parse CA cert: {}", e)))?;
    if ca_certs.is_empty() {
        return Err(NetworkError::Tls("no CA certificate found".to_string()));
    }
    for cert in ca_certs {
        root_store
            .add(cert)
            .map_err(|e| NetworkError::Tls(format!("add CA to root store: {}", e)))?;
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// Load an acceptor from certificate and key files
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let config = build_server_config(&read_pem(cert_path)?, &read_pem(key_path)?)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load client settings from a CA file
pub fn load_client_tls(ca_path: &Path, server_name: &str) -> Result<ClientTls> {
    let config = build_client_config(&read_pem(ca_path)?)?;
    Ok(ClientTls {
        config: Arc::new(config),
        server_name: server_name.to_string(),
    })
}
