//! Proxy error types
//!
//! Two tiers:
//! - [`ProxyError`]: fatal, ends the serve loop and the process
//! - [`ConnectionError`]: absorbed by the task owning the connection, which is closed silently

use thiserror::Error;

use crate::mitm::tls_config::TlsConfigError;
use crate::request::ParseError;
use crate::tls::TlsError;

/// Fatal errors returned by [`crate::Proxy::run`]
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Listening socket could not be opened
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Listening socket broke while accepting
    #[error("Failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// Interception was attempted without a usable server identity
    #[error("TLS server identity unavailable: {0}")]
    Identity(#[source] TlsError),

    /// Registry owner task is gone
    #[error("Client registry stopped")]
    RegistryClosed,

    /// Outbound HTTP client could not be initialised
    #[error("Failed to build upstream HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

impl ProxyError {
    /// Process exit status for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            ProxyError::Accept(_) => 1,
            ProxyError::Bind { .. } => 2,
            ProxyError::Identity(_) => 3,
            ProxyError::RegistryClosed => 4,
            ProxyError::HttpClient(_) => 5,
        }
    }
}

/// Errors local to a single client connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Request parsing failed: {0}")]
    Parse(#[from] ParseError),

    #[error("Timed out waiting for request")]
    RequestTimeout,

    #[error("Invalid CONNECT authority: {0}")]
    InvalidAuthority(String),

    #[error("Upstream connection failed for {addr}: {source}")]
    UpstreamConnect {
        addr: String,
        source: std::io::Error,
    },

    #[error("Upstream connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("TLS handshake failed for {host}: {source}")]
    TlsHandshake {
        host: String,
        source: std::io::Error,
    },

    #[error("TLS configuration failed: {0}")]
    TlsConfig(#[from] TlsConfigError),

    #[error("TLS server identity unavailable: {0}")]
    Identity(#[from] TlsError),

    #[error("Method {0} is not forwarded")]
    UnsupportedMethod(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Whether this failure must take the whole process down
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionError::Identity(_))
    }

    /// Promote a fatal connection error to a [`ProxyError`]
    pub fn into_fatal(self) -> Option<ProxyError> {
        match self {
            ConnectionError::Identity(e) => Some(ProxyError::Identity(e)),
            _ => None,
        }
    }
}
