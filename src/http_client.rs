//! Outbound HTTP requests and relay of their responses to the client

use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use reqwest::redirect::Policy;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::relay;
use crate::request::RequestHead;

/// Shared client for plain-HTTP forwarding: one attempt, redirects passed through.
pub fn build_client(connect_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .redirect(Policy::none())
        .no_proxy()
        .build()
}

/// Single-use client for one intercepted request.
///
/// Uses the given TLS client config and keeps no idle connections, so every
/// intercepted request opens a new TLS session to the origin.
pub fn build_intercept_client(
    tls: rustls::ClientConfig,
    connect_timeout: Duration,
) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .connect_timeout(connect_timeout)
        .redirect(Policy::none())
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
}

pub async fn get(client: &reqwest::Client, url: &str) -> reqwest::Result<reqwest::Response> {
    client.get(url).send().await
}

/// POST `body` to `url`, carrying over the client's Content-Type and, when known, length.
pub async fn post(
    client: &reqwest::Client,
    url: &str,
    head: &RequestHead,
    body: reqwest::Body,
) -> reqwest::Result<reqwest::Response> {
    let mut request = client.post(url);

    if let Some(content_type) = head.content_type() {
        request = request.header(CONTENT_TYPE, content_type.clone());
    }
    if let Some(len) = head.content_length() {
        request = request.header(CONTENT_LENGTH, len);
    }

    request.body(body).send().await
}

/// Write the upstream status line and headers, then stream the body through.
///
/// Returns the number of body bytes delivered.
pub async fn write_response<W>(response: reqwest::Response, dst: &mut W) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let head = response_head(response.status(), response.headers());
    dst.write_all(&head).await?;
    dst.flush().await?;

    let body = std::pin::pin!(response.bytes_stream());
    let written = relay::stream_body(body, dst).await;
    debug!(bytes = written, "Response body relayed");

    Ok(written)
}

fn response_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    // The origin's own reason phrase is not kept; codes without a registered one get a placeholder
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    )
    .into_bytes();

    for (name, value) in filter_response_headers(headers).iter() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    // One request per connection
    head.extend_from_slice(b"Connection: close\r\n\r\n");
    head
}

/// Check if header is hop-by-hop (RFC 7230 § 6.1)
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
    )
}

/// Filter response headers - strip hop-by-hop headers
fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }

    filtered
}
