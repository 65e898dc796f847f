//! HTTP/1.x request head parsing and request body streaming
//!
//! A request head is read line by line off a buffered reader so that bytes following
//! the head (request body, or the first bytes of a tunneled protocol) stay buffered
//! for whoever consumes the connection next.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::relay::CHUNK_SIZE;

/// Upper bound on request line plus headers
pub const MAX_HEADER_SIZE: usize = 16384;
const MAX_HEADERS: usize = 64;
const MAX_CHUNK_LINE: u64 = 4096;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Connection closed before a request arrived")]
    ConnectionClosed,

    #[error("Incomplete HTTP request")]
    Incomplete,

    #[error("Headers too large (> 16KB)")]
    HeadersTooLarge,

    #[error("Invalid HTTP format: {0}")]
    InvalidFormat(String),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Unsupported HTTP version")]
    UnsupportedVersion,

    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<httparse::Error> for ParseError {
    fn from(e: httparse::Error) -> Self {
        ParseError::InvalidFormat(e.to_string())
    }
}

/// How the request body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
}

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request target exactly as sent (absolute-form, origin-form or authority-form)
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub framing: BodyFraming,
}

impl RequestHead {
    pub fn content_type(&self) -> Option<&HeaderValue> {
        self.headers.get(http::header::CONTENT_TYPE)
    }

    pub fn content_length(&self) -> Option<u64> {
        match self.framing {
            BodyFraming::Length(len) => Some(len),
            BodyFraming::Empty => Some(0),
            BodyFraming::Chunked => None,
        }
    }

    /// Host header, falling back to the authority of an absolute-form target
    pub fn host(&self) -> Option<String> {
        self.headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .or_else(|| {
                self.target
                    .parse::<Uri>()
                    .ok()
                    .and_then(|uri| uri.authority().map(|a| a.to_string()))
            })
    }

    /// Origin-form path and query of the target
    pub fn path(&self) -> String {
        match self.target.parse::<Uri>() {
            Ok(uri) if uri.scheme().is_some() => uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            _ => self.target.clone(),
        }
    }
}

/// Read exactly one request head from `reader`.
///
/// Bytes after the blank line terminating the head are left in the reader.
pub async fn read_request<R>(reader: &mut R) -> Result<RequestHead, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);

    loop {
        let remaining = MAX_HEADER_SIZE.saturating_sub(head.len());
        if remaining == 0 {
            return Err(ParseError::HeadersTooLarge);
        }

        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut head)
            .await?;

        if n == 0 {
            return Err(if head.is_empty() {
                ParseError::ConnectionClosed
            } else {
                ParseError::Incomplete
            });
        }

        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
    }

    parse_head(&head)
}

fn parse_head(buf: &[u8]) -> Result<RequestHead, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    if req.parse(buf)?.is_partial() {
        return Err(ParseError::Incomplete);
    }

    let method_str = req
        .method
        .ok_or_else(|| ParseError::InvalidFormat("missing method".to_string()))?;
    let method = Method::from_bytes(method_str.as_bytes())
        .map_err(|_| ParseError::InvalidMethod(method_str.to_string()))?;

    let target = req
        .path
        .ok_or_else(|| ParseError::InvalidFormat("missing request target".to_string()))?
        .to_string();

    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(ParseError::UnsupportedVersion),
    };

    let mut header_map = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| ParseError::InvalidFormat(e.to_string()))?;
        let value =
            HeaderValue::from_bytes(h.value).map_err(|e| ParseError::InvalidFormat(e.to_string()))?;
        header_map.append(name, value);
    }

    let framing = body_framing(&method, &header_map)?;

    Ok(RequestHead {
        method,
        target,
        version,
        headers: header_map,
        framing,
    })
}

fn body_framing(method: &Method, headers: &HeaderMap) -> Result<BodyFraming, ParseError> {
    if method == Method::CONNECT {
        return Ok(BodyFraming::Empty);
    }

    let transfer_encodings: Vec<&HeaderValue> =
        headers.get_all(http::header::TRANSFER_ENCODING).iter().collect();
    if let Some(last) = transfer_encodings.last() {
        let codings = last
            .to_str()
            .map_err(|_| ParseError::InvalidFormat("non-ASCII Transfer-Encoding".to_string()))?;
        let chunked_last = codings
            .rsplit(',')
            .next()
            .map(|c| c.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);
        if !chunked_last {
            return Err(ParseError::InvalidFormat(format!(
                "unsupported Transfer-Encoding: {}",
                codings
            )));
        }
        return Ok(BodyFraming::Chunked);
    }

    let mut length: Option<u64> = None;
    for value in headers.get_all(http::header::CONTENT_LENGTH) {
        let raw = value
            .to_str()
            .map_err(|_| ParseError::InvalidContentLength("non-ASCII".to_string()))?
            .trim();
        let parsed: u64 = raw
            .parse()
            .map_err(|_| ParseError::InvalidContentLength(raw.to_string()))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(ParseError::InvalidContentLength(format!(
                    "conflicting values {} and {}",
                    existing, parsed
                )));
            }
            _ => length = Some(parsed),
        }
    }

    Ok(match length {
        Some(0) | None => BodyFraming::Empty,
        Some(len) => BodyFraming::Length(len),
    })
}

/// Stream the request body that follows a parsed head, de-chunking if needed.
///
/// A body cut short by the client yields an `UnexpectedEof` error as its last item.
pub fn body_stream<R>(reader: R, framing: BodyFraming) -> BoxStream<'static, io::Result<Bytes>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    match framing {
        BodyFraming::Empty => stream::empty().boxed(),
        BodyFraming::Length(len) => sized_body(reader, len),
        BodyFraming::Chunked => chunked_body(BufReader::new(reader)),
    }
}

fn sized_body<R>(reader: R, len: u64) -> BoxStream<'static, io::Result<Bytes>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(reader.take(len)), |state| async move {
        let mut reader = state?;
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        match reader.read_buf(&mut buf).await {
            Ok(0) if reader.limit() > 0 => Some((
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("request body ended {} bytes early", reader.limit()),
                )),
                None,
            )),
            Ok(0) => None,
            Ok(_) => Some((Ok(buf.freeze()), Some(reader))),
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

fn chunked_body<R>(reader: R) -> BoxStream<'static, io::Result<Bytes>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let decoder = ChunkedDecoder {
        reader,
        remaining: 0,
        done: false,
    };

    stream::unfold(Some(decoder), |state| async move {
        let mut decoder = state?;
        match decoder.next_chunk().await {
            Ok(Some(data)) => Some((Ok(data), Some(decoder))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

/// Incremental `Transfer-Encoding: chunked` decoder
struct ChunkedDecoder<R> {
    reader: R,
    /// Bytes left in the current chunk
    remaining: u64,
    done: bool,
}

impl<R> ChunkedDecoder<R>
where
    R: AsyncBufRead + Unpin,
{
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }

        if self.remaining == 0 {
            let size = self.read_size_line().await?;
            if size == 0 {
                self.read_trailers().await?;
                self.done = true;
                return Ok(None);
            }
            self.remaining = size;
        }

        let want = self.remaining.min(CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; want];
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "incomplete chunk data",
            ));
        }
        buf.truncate(n);
        self.remaining -= n as u64;

        if self.remaining == 0 {
            let line = self.read_line().await?;
            if !is_blank(&line) {
                return Err(invalid_data("missing CRLF after chunk data"));
            }
        }

        Ok(Some(Bytes::from(buf)))
    }

    async fn read_size_line(&mut self) -> io::Result<u64> {
        let line = self.read_line().await?;
        let text = std::str::from_utf8(&line).map_err(|_| invalid_data("invalid chunk size"))?;

        // Strip chunk extensions (everything after semicolon)
        let size_only = text.split(';').next().unwrap_or(text).trim();

        u64::from_str_radix(size_only, 16)
            .map_err(|_| invalid_data(format!("invalid chunk size hex: {}", size_only)))
    }

    async fn read_trailers(&mut self) -> io::Result<()> {
        loop {
            let line = self.read_line().await?;
            if is_blank(&line) {
                return Ok(());
            }
        }
    }

    async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();
        let n = (&mut self.reader)
            .take(MAX_CHUNK_LINE)
            .read_until(b'\n', &mut line)
            .await?;

        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "incomplete chunked body",
            ));
        }
        if !line.ends_with(b"\n") {
            return Err(invalid_data("chunk line too long"));
        }

        Ok(line)
    }
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
