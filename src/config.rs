use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Ceiling on concurrently registered clients
pub const DEFAULT_MAX_CLIENTS: usize = 32;

/// Deadline for a client to deliver its request line and headers
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Deadline for establishing outbound TCP connections
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_CERT_PATH: &str = "config/server.crt";
pub const DEFAULT_KEY_PATH: &str = "config/server.key";

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// `hostname:port` to listen on
    pub listen_addr: String,

    /// Admission ceiling. Best-effort: a snapshot of the registry size gates each accept.
    pub max_clients: usize,

    pub request_timeout: Duration,
    pub connect_timeout: Duration,

    pub intercept: InterceptConfig,
}

/// TLS interception settings
#[derive(Debug, Clone)]
pub struct InterceptConfig {
    pub enabled: bool,

    /// Hosts to intercept (exact or `*.example.com`). Empty means every host.
    pub hosts: Vec<String>,

    // Server identity presented to intercepted clients
    pub cert_path: PathBuf,
    pub key_path: PathBuf,

    /// CA bundle for optional client certificate verification
    pub client_ca_path: Option<PathBuf>,

    /// Verify the real origin's certificate chain against the webpki roots
    pub verify_upstream: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            max_clients: DEFAULT_MAX_CLIENTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            intercept: InterceptConfig::default(),
        }
    }
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hosts: Vec::new(),
            cert_path: PathBuf::from(DEFAULT_CERT_PATH),
            key_path: PathBuf::from(DEFAULT_KEY_PATH),
            client_ca_path: None,
            verify_upstream: true,
        }
    }
}

impl ProxyConfig {
    /// Build a config listening on `hostname:port` with every other setting at its default.
    pub fn new(hostname: &str, port: u16) -> Self {
        Self {
            listen_addr: format!("{}:{}", hostname, port),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let host = env::var("PROXY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("PROXY_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("Invalid PROXY_PORT")?;

        let request_timeout_seconds: u64 = env::var("REQUEST_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| DEFAULT_REQUEST_TIMEOUT.as_secs().to_string())
            .parse()
            .context("Invalid REQUEST_TIMEOUT_SECONDS")?;
        let connect_timeout_seconds: u64 = env::var("CONNECT_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| DEFAULT_CONNECT_TIMEOUT.as_secs().to_string())
            .parse()
            .context("Invalid CONNECT_TIMEOUT_SECONDS")?;

        let intercept = InterceptConfig::from_env()?;

        Ok(Self {
            listen_addr: format!("{}:{}", host, port),
            max_clients: DEFAULT_MAX_CLIENTS,
            request_timeout: Duration::from_secs(request_timeout_seconds),
            connect_timeout: Duration::from_secs(connect_timeout_seconds),
            intercept,
        })
    }
}

impl InterceptConfig {
    pub fn from_env() -> Result<Self> {
        let enabled = env::var("MITM_ENABLED")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .context("Invalid MITM_ENABLED")?;

        let hosts = env::var("MITM_HOSTS")
            .map(|raw| parse_host_list(&raw))
            .unwrap_or_default();

        let cert_path = env::var("TLS_CERT_PATH").unwrap_or_else(|_| DEFAULT_CERT_PATH.to_string());
        let key_path = env::var("TLS_KEY_PATH").unwrap_or_else(|_| DEFAULT_KEY_PATH.to_string());
        let client_ca_path = env::var("MITM_CLIENT_CA_PATH").ok().map(PathBuf::from);

        // Testing only: accept any origin certificate
        let verify_upstream = env::var("DISABLE_TLS_VERIFY_NONPROD").is_err();
        if !verify_upstream {
            tracing::warn!("Upstream TLS verification DISABLED for intercepted connections");
        }

        Ok(Self {
            enabled,
            hosts,
            cert_path: PathBuf::from(cert_path),
            key_path: PathBuf::from(key_path),
            client_ca_path,
            verify_upstream,
        })
    }
}

fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}
