//! Method handlers
//!
//! Each handler owns the rest of one client connection. Failures are returned to
//! the dispatcher, which logs them and closes the connection without a response.

use http::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::client::Client;
use crate::error::ConnectionError;
use crate::http_client;
use crate::mitm::MitmInterceptor;
use crate::relay;
use crate::request::{self, RequestHead};

pub const OPTIONS_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nAllow: GET,POST,CONNECT,OPTIONS\r\n\r\n";
pub const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// What handlers share across connections
pub struct Context {
    pub http: reqwest::Client,
    pub connect_timeout: Duration,
    pub interceptor: Option<Arc<MitmInterceptor>>,
}

/// Route a parsed request to its handler. Unsupported methods are a no-op.
pub async fn dispatch<S>(client: &mut Client<S>, ctx: &Context) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some(head) = client.request().cloned() else {
        return Ok(());
    };

    match head.method {
        Method::GET => get(client, ctx).await,
        Method::POST => post(client, &head, ctx).await,
        Method::OPTIONS => {
            options(client).await;
            Ok(())
        }
        Method::CONNECT => connect(client, &head.target, ctx).await,
        other => {
            debug!(peer = client.peer(), method = %other, "Method not handled, closing");
            Ok(())
        }
    }
}

pub async fn get<S>(client: &mut Client<S>, ctx: &Context) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = http_client::get(&ctx.http, client.url()).await?;
    let status = response.status();
    let bytes = http_client::write_response(response, client.conn_mut()?).await?;

    info!(peer = client.peer(), url = client.url(), status = status.as_u16(), bytes, "GET relayed");
    Ok(())
}

/// Forward the request body as it arrives; the response goes back on the same socket.
pub async fn post<S>(
    client: &mut Client<S>,
    head: &RequestHead,
    ctx: &Context,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let url = client.url().to_string();
    let (reader, mut writer) = tokio::io::split(client.take_conn()?);
    let body = reqwest::Body::wrap_stream(request::body_stream(reader, head.framing));

    let response = http_client::post(&ctx.http, &url, head, body).await?;
    let status = response.status();
    let bytes = http_client::write_response(response, &mut writer).await?;

    info!(peer = client.peer(), url = %url, status = status.as_u16(), bytes, "POST relayed");
    Ok(())
}

/// Write errors are ignored; there is nothing left to do with this client.
pub async fn options<S>(client: &mut Client<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Ok(conn) = client.conn_mut() {
        let _ = conn.write_all(OPTIONS_RESPONSE).await;
        let _ = conn.flush().await;
    }
}

pub async fn connect<S>(
    client: &mut Client<S>,
    authority: &str,
    ctx: &Context,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (host, port) = parse_authority(authority)?;

    if let Some(interceptor) = ctx
        .interceptor
        .as_ref()
        .filter(|i| i.should_intercept(&host))
    {
        debug!(peer = client.peer(), target = %authority, "Intercepting CONNECT");
        return interceptor.intercept(client.take_conn()?, &host, port).await;
    }

    let upstream = connect_upstream(authority, ctx.connect_timeout).await?;

    let mut conn = client.take_conn()?;
    conn.write_all(TUNNEL_ESTABLISHED).await?;
    conn.flush().await?;

    debug!(peer = client.peer(), target = %authority, "Tunnel established");
    let stats = relay::tunnel(conn, upstream).await;

    info!(
        peer = client.peer(),
        target = %authority,
        bytes_up = stats.client_to_upstream,
        bytes_down = stats.upstream_to_client,
        "Tunnel closed"
    );
    Ok(())
}

async fn connect_upstream(authority: &str, limit: Duration) -> Result<TcpStream, ConnectionError> {
    match timeout(limit, TcpStream::connect(authority)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ConnectionError::UpstreamConnect {
            addr: authority.to_string(),
            source,
        }),
        Err(_) => Err(ConnectionError::ConnectTimeout(authority.to_string())),
    }
}

/// Split a CONNECT authority into host and port.
///
/// The port is mandatory and non-zero. IPv6 literals come back without brackets.
pub fn parse_authority(authority: &str) -> Result<(String, u16), ConnectionError> {
    let invalid = |reason: &str| ConnectionError::InvalidAuthority(format!("{}: {}", authority, reason));

    // Split by last colon to handle IPv6 addresses like [::1]:443
    let (host, port_str) = authority
        .rsplit_once(':')
        .ok_or_else(|| invalid("must be in host:port format"))?;

    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| invalid("unterminated IPv6 literal"))?,
        None if host.contains(':') => return Err(invalid("IPv6 literal must be bracketed")),
        None => host,
    };

    if host.is_empty() {
        return Err(invalid("host cannot be empty"));
    }

    let port: u16 = port_str
        .parse()
        .map_err(|_| invalid("port must be a number between 1 and 65535"))?;
    if port == 0 {
        return Err(invalid("port must be between 1 and 65535"));
    }

    Ok((host.to_string(), port))
}
