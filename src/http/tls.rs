// TLS server configuration from PEM certificate pairs.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::router::ServerError;

/// One PEM certificate chain and its PEM private key.
#[derive(Clone)]
pub struct CertificatePair {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// Builds a rustls server config from the provided pairs. The ALPN list
/// is left for the caller to fill in.
pub fn build_server_config(pairs: &[CertificatePair]) -> Result<rustls::ServerConfig, ServerError> {
    let Some(first) = pairs.first() else {
        return Err(ServerError::TlsConfig("no certificate pairs provided".to_string()));
    };

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &first.cert_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(ServerError::TlsConfig("certificate PEM holds no certificates".to_string()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &first.key_pem[..])
        .map_err(|e| ServerError::TlsConfig(format!("invalid key PEM: {}", e)))?
        .ok_or_else(|| ServerError::TlsConfig("key PEM holds no private key".to_string()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::TlsConfig(e.to_string()))
}
