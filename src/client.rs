//! Connection-bound client record

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::time::timeout;

use crate::error::ConnectionError;
use crate::registry::{ClientState, Lifecycle};
use crate::request::{self, RequestHead};

/// One accepted socket, from accept until its task returns.
///
/// The connection is handed off (taken) by handlers that need to own it, such as
/// the tunnel and the TLS interceptor. Whatever is left is closed on drop.
pub struct Client<S> {
    conn: Option<BufReader<S>>,
    request: Option<RequestHead>,
    url: String,
    peer: String,
    state: ClientState,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            conn: Some(BufReader::new(stream)),
            request: None,
            url: String::new(),
            peer: peer.into(),
            state: ClientState::Disconnected,
        }
    }

    /// Parse one request head, giving the client at most `deadline` to send it.
    pub async fn read_request(&mut self, deadline: Duration) -> Result<&RequestHead, ConnectionError> {
        let conn = self.conn_mut()?;
        let head = timeout(deadline, request::read_request(conn))
            .await
            .map_err(|_| ConnectionError::RequestTimeout)??;

        self.url = head.target.clone();
        Ok(self.request.insert(head))
    }

    /// Mark the client connected, returning the message to publish
    pub fn connect(&mut self) -> Lifecycle {
        self.state = ClientState::Connected;
        Lifecycle::connected(self.peer.clone())
    }

    pub fn disconnect(&mut self) -> Lifecycle {
        self.state = ClientState::Disconnected;
        Lifecycle::disconnected(self.peer.clone())
    }

    pub fn request(&self) -> Option<&RequestHead> {
        self.request.as_ref()
    }

    /// Target URL exactly as requested
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn conn_mut(&mut self) -> io::Result<&mut BufReader<S>> {
        self.conn
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection handed off"))
    }

    /// Take ownership of the connection, including any bytes already buffered
    pub fn take_conn(&mut self) -> io::Result<BufReader<S>> {
        self.conn
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection handed off"))
    }
}
