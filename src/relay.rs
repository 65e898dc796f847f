//! Byte relays
//!
//! - [`tunnel`]: full-duplex relay built from two directional transfers
//! - [`stream_body`]: chunked write-through of an upstream response body
//!
//! Both keep at most one [`CHUNK_SIZE`] buffer per direction in memory.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::debug;

pub const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// Bytes moved in each direction of a finished tunnel
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

impl TunnelStats {
    fn record(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::ClientToUpstream => self.client_to_upstream = bytes,
            Direction::UpstreamToClient => self.upstream_to_client = bytes,
        }
    }
}

/// Copy `src` into `dst` one chunk at a time until EOF, flushing each chunk.
async fn pump<R, W>(src: &mut R, dst: &mut W, transferred: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
        *transferred += n as u64;
    }
}

/// Relay bytes between `client` and `upstream` until either side closes or fails.
///
/// Each direction runs as its own task and reports on a two-slot completion channel.
/// The first report stops the other direction; this returns once both have reported,
/// by which point both streams have been dropped.
pub async fn tunnel<C, U>(client: C, upstream: U) -> TunnelStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let (done_tx, mut done_rx) = mpsc::channel(2);
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(transfer(
        client_read,
        upstream_write,
        Direction::ClientToUpstream,
        stop_rx.clone(),
        done_tx.clone(),
    ));
    tokio::spawn(transfer(
        upstream_read,
        client_write,
        Direction::UpstreamToClient,
        stop_rx,
        done_tx,
    ));

    let mut stats = TunnelStats::default();
    for _ in 0..2 {
        match done_rx.recv().await {
            Some((direction, bytes)) => {
                stats.record(direction, bytes);
                // Other direction may still be parked on a read
                let _ = stop_tx.send(true);
            }
            None => break,
        }
    }

    stats
}

async fn transfer<R, W>(
    mut src: R,
    mut dst: W,
    direction: Direction,
    mut stop: watch::Receiver<bool>,
    done: mpsc::Sender<(Direction, u64)>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut transferred = 0u64;

    tokio::select! {
        result = pump(&mut src, &mut dst, &mut transferred) => {
            if let Err(e) = result {
                debug!(direction = ?direction, error = %e, "Relay stopped on I/O error");
            }
        }
        _ = stop.changed() => {
            debug!(direction = ?direction, "Relay stopped after opposite direction finished");
        }
    }

    // Destination may already be broken
    let _ = dst.shutdown().await;
    drop(src);
    drop(dst);

    let _ = done.send((direction, transferred)).await;
}

/// Write an upstream body to `dst` as it arrives, never holding more than one chunk.
///
/// End of body and a body read error both simply end the stream; a write error
/// ends it too. Returns the number of body bytes written.
pub async fn stream_body<S, E, W>(mut body: S, dst: &mut W) -> u64
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;

    while let Some(item) = body.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, written, "Upstream body read failed, stopping");
                break;
            }
        };

        for piece in chunk.chunks(CHUNK_SIZE) {
            if let Err(e) = write_piece(dst, piece).await {
                debug!(error = %e, written, "Downstream write failed, stopping");
                return written;
            }
            written += piece.len() as u64;
        }
    }

    written
}

async fn write_piece<W>(dst: &mut W, piece: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    dst.write_all(piece).await?;
    dst.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_tunnel_relays_both_ways_and_tears_down() {
        let (mut client, proxy_client_side) = tokio::io::duplex(1024);
        let (proxy_upstream_side, mut upstream) = tokio::io::duplex(1024);

        let handle = tokio::spawn(tunnel(proxy_client_side, proxy_upstream_side));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // Client hangs up; the tunnel must finish and close the upstream side too
        drop(client);

        let stats = timeout(Duration::from_secs(2), handle)
            .await
            .expect("tunnel did not finish")
            .unwrap();
        assert_eq!(stats.client_to_upstream, 4);
        assert_eq!(stats.upstream_to_client, 5);

        let mut rest = Vec::new();
        let n = upstream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_tunnel_moves_payloads_larger_than_a_chunk() {
        let (mut client, proxy_client_side) = tokio::io::duplex(1024);
        let (proxy_upstream_side, mut upstream) = tokio::io::duplex(1024);
        let handle = tokio::spawn(tunnel(proxy_client_side, proxy_upstream_side));

        let data = vec![7u8; CHUNK_SIZE * 3 + 11];
        let sent = data.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&sent).await.unwrap();
            client
        });

        let mut got = vec![0u8; data.len()];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(got, data);

        drop(writer.await.unwrap());
        let stats = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(stats.client_to_upstream, data.len() as u64);
    }

    #[tokio::test]
    async fn test_tunnel_finishes_when_upstream_closes_first() {
        let (mut client, proxy_client_side) = tokio::io::duplex(1024);
        let (proxy_upstream_side, upstream) = tokio::io::duplex(1024);

        let handle = tokio::spawn(tunnel(proxy_client_side, proxy_upstream_side));
        drop(upstream);

        timeout(Duration::from_secs(2), handle)
            .await
            .expect("tunnel did not finish")
            .unwrap();

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stream_body_writes_before_body_completes() {
        let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(1);
        let body = Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }));

        let (mut reader, mut writer) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(async move { stream_body(body, &mut writer).await });

        let first = vec![b'a'; CHUNK_SIZE * 2 + 100];
        tx.send(Ok(Bytes::from(first.clone()))).await.unwrap();

        // The first chunk must reach the destination while the body is still open
        let mut got = vec![0u8; first.len()];
        timeout(Duration::from_secs(2), reader.read_exact(&mut got))
            .await
            .expect("first chunk was buffered instead of streamed")
            .unwrap();
        assert_eq!(got, first);

        tx.send(Ok(Bytes::from_static(b"tail"))).await.unwrap();
        drop(tx);

        let written = handle.await.unwrap();
        assert_eq!(written, first.len() as u64 + 4);

        let mut tail = [0u8; 4];
        reader.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"tail");
    }

    #[tokio::test]
    async fn test_stream_body_stops_on_read_error() {
        let items: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"def")),
        ];
        let mut dst = Vec::new();

        let written = stream_body(stream::iter(items), &mut dst).await;
        assert_eq!(written, 3);
        assert_eq!(dst, b"abc");
    }
}
