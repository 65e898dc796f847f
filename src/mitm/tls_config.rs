//! TLS configuration for interception
//!
//! - Client-facing TLS (proxy ← client) presenting the provisioned identity
//! - Upstream TLS (proxy → origin) verified against the webpki roots
//!
//! Both sides speak TLS 1.2/1.3 and advertise `http/1.1` only. The ring provider
//! is passed explicitly so no process-wide default provider is required.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

use crate::tls::ServerIdentity;

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn http11_only() -> Vec<Vec<u8>> {
    vec![b"http/1.1".to_vec()]
}

/// Client-facing TLS config (proxy acts as server)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    /// Build a server config presenting `identity`.
    ///
    /// With `client_roots`, a client certificate is requested and verified if the
    /// client sends one, but not required.
    pub fn new(
        identity: ServerIdentity,
        client_roots: Option<Arc<RootCertStore>>,
    ) -> Result<Self, TlsConfigError> {
        let builder = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

        let optional_client_auth = client_roots.is_some();
        let builder = match client_roots {
            Some(roots) => {
                let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider())
                    .allow_unauthenticated()
                    .build()
                    .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder
            .with_single_cert(identity.cert_chain, identity.key)
            .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;
        config.alpn_protocols = http11_only();

        debug!(optional_client_auth, "Client-facing TLS config created");

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Build a fresh upstream client config.
///
/// `verify = false` accepts any origin certificate and exists for testing against
/// self-signed origins only.
pub fn upstream_client_config(verify: bool) -> Result<ClientConfig, TlsConfigError> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&TLS12, &TLS13])
        .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

    let mut config = if verify {
        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        let verifier = NoCertVerifier {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        };
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth()
    };
    config.alpn_protocols = http11_only();

    Ok(config)
}

/// Parse hostname into ServerName for SNI
pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>, TlsConfigError> {
    ServerName::try_from(hostname.to_owned())
        .map_err(|e| TlsConfigError::InvalidServerName(format!("{}: {}", hostname, e)))
}

/// No-op certificate verifier (ONLY FOR TESTING)
#[derive(Debug)]
struct NoCertVerifier {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ServerIdentity {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["intercept.test".to_string()]).unwrap();
        ServerIdentity::from_pem(cert.pem().as_bytes(), key_pair.serialize_pem().as_bytes())
            .unwrap()
    }

    #[test]
    fn test_client_facing_config_advertises_http11() {
        let config = ClientTlsConfig::new(identity(), None).unwrap();
        assert_eq!(config.server_config().alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_client_facing_config_with_optional_client_auth() {
        let rcgen::CertifiedKey { cert, .. } =
            rcgen::generate_simple_self_signed(vec!["client-ca.test".to_string()]).unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(cert.der().clone()).unwrap();

        assert!(ClientTlsConfig::new(identity(), Some(Arc::new(roots))).is_ok());
    }

    #[test]
    fn test_upstream_configs_build() {
        assert!(upstream_client_config(true).is_ok());
        assert!(upstream_client_config(false).is_ok());
    }

    #[test]
    fn test_parse_server_name() {
        assert!(parse_server_name("example.com").is_ok());
        assert!(parse_server_name("127.0.0.1").is_ok());
        assert!(matches!(
            parse_server_name("not a host"),
            Err(TlsConfigError::InvalidServerName(_))
        ));
    }
}
