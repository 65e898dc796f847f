//! Server identity input for TLS interception
//!
//! The proxy never mints certificates. It is handed an X.509 keypair through an
//! [`IdentityProvider`] and presents it to intercepted clients.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{RootCertStore, ServerConfig};
use std::sync::Arc;
use rustls_pemfile::{certs, private_key};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),
}

/// Certificate chain plus matching private key
pub struct ServerIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { cert_chain, key }
    }

    /// Parse a PEM certificate chain and a PEM private key (PKCS#8, PKCS#1 or SEC1)
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        Self::parse_pem(cert_pem, "<memory>", key_pem, "<memory>")
    }

    fn parse_pem(
        mut cert_pem: &[u8],
        cert_origin: &str,
        mut key_pem: &[u8],
        key_origin: &str,
    ) -> Result<Self, TlsError> {
        let cert_chain = certs(&mut cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TlsError::Read {
                path: cert_origin.to_string(),
                source,
            })?;

        if cert_chain.is_empty() {
            return Err(TlsError::NoCertificates(cert_origin.to_string()));
        }

        let key = private_key(&mut key_pem)
            .map_err(|source| TlsError::Read {
                path: key_origin.to_string(),
                source,
            })?
            .ok_or_else(|| TlsError::NoPrivateKey(key_origin.to_string()))?;

        let identity = Self { cert_chain, key };
        identity.check()?;
        Ok(identity)
    }

    /// Reject a keypair rustls cannot serve with, such as a key that does not
    /// belong to the leaf certificate.
    pub fn check(&self) -> Result<(), TlsError> {
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map(|_| ())
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))
    }
}

impl Clone for ServerIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("certificates", &self.cert_chain.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Source of the identity presented to intercepted clients
pub trait IdentityProvider: Send + Sync {
    fn load(&self) -> Result<ServerIdentity, TlsError>;
}

/// Identity already held in memory
impl IdentityProvider for ServerIdentity {
    fn load(&self) -> Result<ServerIdentity, TlsError> {
        self.check()?;
        Ok(self.clone())
    }
}

/// Identity read from PEM files each time it is needed
#[derive(Debug, Clone)]
pub struct PemIdentity {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl PemIdentity {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

impl IdentityProvider for PemIdentity {
    fn load(&self) -> Result<ServerIdentity, TlsError> {
        load_certs_and_key(&self.cert_path, &self.key_path)
    }
}

/// Load TLS certificates and private key from files
pub fn load_certs_and_key(cert_path: &Path, key_path: &Path) -> Result<ServerIdentity, TlsError> {
    let cert_pem = read_file(cert_path)?;
    let key_pem = read_file(key_path)?;

    ServerIdentity::parse_pem(
        &cert_pem,
        &cert_path.display().to_string(),
        &key_pem,
        &key_path.display().to_string(),
    )
}

/// Load a PEM CA bundle used to verify optional client certificates
pub fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let pem = read_file(path)?;
    let origin = path.display().to_string();

    let mut store = RootCertStore::empty();
    for cert in certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|source| TlsError::Read {
            path: origin.clone(),
            source,
        })?;
        store
            .add(cert)
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
    }

    if store.is_empty() {
        return Err(TlsError::NoCertificates(origin));
    }

    Ok(store)
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}
