// Shared fixtures for the integration tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mitmgate::{IdentityProvider, Proxy, ProxyConfig, ProxyError, RegistryHandle, ServerIdentity};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const TUNNEL_OK: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

pub struct TestProxy {
    pub addr: SocketAddr,
    pub registry: RegistryHandle,
    pub handle: JoinHandle<Result<(), ProxyError>>,
}

pub fn test_config() -> ProxyConfig {
    ProxyConfig::new("127.0.0.1", 0)
}

pub async fn spawn_proxy(config: ProxyConfig) -> TestProxy {
    start(Proxy::new(config).unwrap()).await
}

pub async fn spawn_proxy_with_identity(
    config: ProxyConfig,
    identity: Arc<dyn IdentityProvider>,
) -> TestProxy {
    start(Proxy::with_identity(config, identity).unwrap()).await
}

async fn start(mut proxy: Proxy) -> TestProxy {
    let addr = proxy.listen().await.unwrap();
    let registry = proxy.registry();
    let handle = tokio::spawn(proxy.run());
    TestProxy {
        addr,
        registry,
        handle,
    }
}

/// Wait until the registry reports `expected` clients
pub async fn wait_for_size(registry: &RegistryHandle, expected: usize) {
    timeout(Duration::from_secs(5), registry.wait_until(|n| n == expected))
        .await
        .unwrap_or_else(|_| panic!("registry never reached {} (now {})", expected, registry.size()))
        .unwrap();
}

/// Read until the peer closes, bounded by a timeout
pub async fn read_until_close<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("connection was not closed");
    out
}

/// Split a raw HTTP response into head text and body bytes
pub fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let pos = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator in response");
    (
        String::from_utf8_lossy(&raw[..pos]).to_string(),
        raw[pos + 4..].to_vec(),
    )
}

pub async fn send_connect(proxy: SocketAddr, target: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

pub async fn expect_tunnel_ok(stream: &mut TcpStream) {
    let mut buf = [0u8; TUNNEL_OK.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("no CONNECT response")
        .unwrap();
    assert_eq!(&buf, TUNNEL_OK);
}

/// Minimal request seen by a test origin
pub struct OriginRequest {
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

async fn read_origin_request<S: AsyncRead + Unpin>(stream: &mut S) -> Option<OriginRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(&buf[..head_end]).ok()?;

    let header = |name: &str| {
        req.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| String::from_utf8_lossy(h.value).to_string())
    };
    let content_length: usize = header("content-length")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    let content_type = header("content-type");
    let chunked = header("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    let mut body = buf[head_end..].to_vec();
    loop {
        let complete = if chunked {
            body.ends_with(b"0\r\n\r\n")
        } else {
            body.len() >= content_length
        };
        if complete {
            break;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    if chunked {
        body = dechunk(&body);
    }

    Some(OriginRequest {
        method: req.method?.to_string(),
        path: req.path?.to_string(),
        content_type,
        body,
    })
}

fn dechunk(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(pos) = rest.windows(2).position(|w| w == b"\r\n") {
        let size_line = String::from_utf8_lossy(&rest[..pos]).to_string();
        let size = usize::from_str_radix(size_line.split(';').next().unwrap_or("0").trim(), 16)
            .unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = pos + 2;
        out.extend_from_slice(&rest[start..start + size]);
        rest = &rest[start + size + 2..];
    }
    out
}

/// Answer one request: GET gets a body naming the path, POST gets its own body back.
async fn serve_origin<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) {
    let Some(request) = read_origin_request(&mut stream).await else {
        return;
    };

    let body = if request.method == "POST" {
        request.body.clone()
    } else {
        format!("origin saw {} {}", request.method, request.path).into_bytes()
    };

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nX-Seen-Content-Type: {}\r\nConnection: keep-alive\r\n\r\n",
        body.len(),
        request.content_type.as_deref().unwrap_or("none"),
    );
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(&body).await;
    let _ = stream.shutdown().await;
}

pub async fn spawn_http_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_origin(stream));
        }
    });

    addr
}

pub fn self_signed(host: &str) -> (ServerIdentity, rustls::pki_types::CertificateDer<'static>) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
    let identity =
        ServerIdentity::from_pem(cert.pem().as_bytes(), key_pair.serialize_pem().as_bytes())
            .unwrap();
    (identity, cert.der().clone())
}

/// HTTPS origin with its own self-signed certificate for `localhost`
pub async fn spawn_tls_origin() -> SocketAddr {
    let (identity, _) = self_signed("localhost");
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(identity.cert_chain, identity.key)
    .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    serve_origin(tls).await;
                }
            });
        }
    });

    addr
}

/// TLS client config that trusts exactly `root`
pub fn client_tls_trusting(root: rustls::pki_types::CertificateDer<'static>) -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(root).unwrap();
    rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// TCP peer that echoes every byte back until EOF
pub async fn spawn_echo_peer() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

/// Origin that sends `first`, then waits for `release` before sending `rest`
pub async fn spawn_drip_origin(
    first: Vec<u8>,
    rest: Vec<u8>,
    release: oneshot::Receiver<()>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        if read_origin_request(&mut stream).await.is_none() {
            return;
        }

        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
            first.len() + rest.len()
        );
        let _ = stream.write_all(head.as_bytes()).await;
        let _ = stream.write_all(&first).await;
        let _ = stream.flush().await;

        let _ = release.await;
        let _ = stream.write_all(&rest).await;
        let _ = stream.shutdown().await;
    });

    addr
}

/// Address nothing is listening on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
