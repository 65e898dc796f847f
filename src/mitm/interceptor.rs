//! MITM Interceptor - Main interception logic
//!
//! Flow for one intercepted CONNECT:
//! 1. Load the server identity (failure is fatal to the proxy)
//! 2. Answer `200 OK`, then accept TLS over the same socket
//! 3. Read one decrypted request
//! 4. Re-issue it over a brand-new TLS connection to the real origin
//! 5. Stream the origin response back through the client TLS session

use http::Method;
use rustls::RootCertStore;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::ConnectionError;
use crate::handlers::TUNNEL_ESTABLISHED;
use crate::http_client;
use crate::mitm::matcher::HostMatcher;
use crate::mitm::tls_config::{
    parse_server_name, upstream_client_config, ClientTlsConfig, TlsConfigError,
};
use crate::request;
use crate::tls::{load_root_store, IdentityProvider, TlsError};

pub struct MitmInterceptor {
    identity: Arc<dyn IdentityProvider>,
    matcher: HostMatcher,
    client_roots: Option<Arc<RootCertStore>>,
    verify_upstream: bool,
    request_timeout: Duration,
    connect_timeout: Duration,
}

impl MitmInterceptor {
    /// Build the interceptor from `config`. Fails only if a configured client CA bundle
    /// cannot be loaded; the server identity itself is loaded per connection.
    pub fn new(config: &ProxyConfig, identity: Arc<dyn IdentityProvider>) -> Result<Self, TlsError> {
        let intercept = &config.intercept;

        let client_roots = match &intercept.client_ca_path {
            Some(path) => Some(Arc::new(load_root_store(path)?)),
            None => None,
        };

        if !intercept.verify_upstream {
            warn!("Origin certificates will NOT be verified for intercepted connections");
        }

        info!(
            hosts = ?intercept.hosts,
            client_auth = client_roots.is_some(),
            "TLS interception enabled"
        );

        Ok(Self {
            identity,
            matcher: HostMatcher::new(&intercept.hosts),
            client_roots,
            verify_upstream: intercept.verify_upstream,
            request_timeout: config.request_timeout,
            connect_timeout: config.connect_timeout,
        })
    }

    pub fn should_intercept(&self, host: &str) -> bool {
        self.matcher.matches(host)
    }

    /// Run one interception over `conn`, the client side of an accepted CONNECT.
    pub async fn intercept<S>(&self, mut conn: S, host: &str, port: u16) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Caller escalates this one
        let identity = self.identity.load()?;

        // An identity rustls refuses to serve with is as unavailable as a missing one
        let tls_config = ClientTlsConfig::new(identity, self.client_roots.clone()).map_err(|e| match e {
            TlsConfigError::InvalidCertificate(msg) => {
                ConnectionError::Identity(TlsError::InvalidCertificate(msg))
            }
            other => other.into(),
        })?;
        let acceptor = TlsAcceptor::from(tls_config.server_config());

        conn.write_all(TUNNEL_ESTABLISHED).await?;
        conn.flush().await?;

        let handshake_failed = |source: io::Error| ConnectionError::TlsHandshake {
            host: host.to_string(),
            source,
        };
        let tls = timeout(self.request_timeout, acceptor.accept(conn))
            .await
            .map_err(|_| handshake_failed(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out")))?
            .map_err(handshake_failed)?;

        debug!(
            host,
            sni = tls.get_ref().1.server_name().unwrap_or("<none>"),
            "Client TLS session established"
        );

        let mut tls = BufReader::new(tls);
        let head = timeout(self.request_timeout, request::read_request(&mut tls))
            .await
            .map_err(|_| ConnectionError::RequestTimeout)??;

        let origin = head.host().unwrap_or_else(|| authority(host, port));
        parse_server_name(hostname(&origin))?;
        let url = format!("https://{}{}", origin, head.path());

        let upstream = http_client::build_intercept_client(
            upstream_client_config(self.verify_upstream)?,
            self.connect_timeout,
        )?;

        let (reader, mut writer) = tokio::io::split(tls);
        let response = match head.method {
            Method::GET => http_client::get(&upstream, &url).await?,
            Method::POST => {
                let body = reqwest::Body::wrap_stream(request::body_stream(reader, head.framing));
                http_client::post(&upstream, &url, &head, body).await?
            }
            other => return Err(ConnectionError::UnsupportedMethod(other.to_string())),
        };

        let status = response.status();
        let bytes = http_client::write_response(response, &mut writer).await?;

        // close_notify
        let _ = writer.shutdown().await;

        info!(
            host,
            url = %url,
            method = %head.method,
            status = status.as_u16(),
            bytes,
            "Intercepted request relayed"
        );
        Ok(())
    }
}

/// `host:port` for a CONNECT target, leaving out the default HTTPS port
fn authority(host: &str, port: u16) -> String {
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };

    if port == 443 {
        host
    } else {
        format!("{}:{}", host, port)
    }
}

/// Host part of a `Host` header value
fn hostname(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}
