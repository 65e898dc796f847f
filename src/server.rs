//! Proxy engine: lazy listener, admission-controlled accept loop, request dispatch

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::handlers::{self, Context};
use crate::http_client;
use crate::mitm::MitmInterceptor;
use crate::registry::{self, RegistryHandle};
use crate::tls::{IdentityProvider, PemIdentity};

/// State shared by every connection task
struct Shared {
    handlers: Context,
    registry: RegistryHandle,
    request_timeout: Duration,
    fatal: mpsc::UnboundedSender<ProxyError>,
}

pub struct Proxy {
    config: ProxyConfig,
    listener: Option<TcpListener>,
    registry: RegistryHandle,
    shared: Arc<Shared>,
    fatal_rx: mpsc::UnboundedReceiver<ProxyError>,
}

impl Proxy {
    /// Build a proxy presenting the PEM identity named in `config.intercept`.
    ///
    /// Must be called inside a Tokio runtime: the registry task starts here.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let identity = PemIdentity::new(&config.intercept.cert_path, &config.intercept.key_path);
        Self::with_identity(config, Arc::new(identity))
    }

    /// Build a proxy with an injected server identity for interception
    pub fn with_identity(
        config: ProxyConfig,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, ProxyError> {
        let http = http_client::build_client(config.connect_timeout).map_err(ProxyError::HttpClient)?;

        let interceptor = if config.intercept.enabled {
            let interceptor = MitmInterceptor::new(&config, identity).map_err(ProxyError::Identity)?;
            Some(Arc::new(interceptor))
        } else {
            None
        };

        let registry = registry::spawn(config.max_clients);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            handlers: Context {
                http,
                connect_timeout: config.connect_timeout,
                interceptor,
            },
            registry: registry.clone(),
            request_timeout: config.request_timeout,
            fatal: fatal_tx,
        });

        Ok(Self {
            config,
            listener: None,
            registry,
            shared,
            fatal_rx,
        })
    }

    /// Open the listening socket if not already open, returning its local address
    pub async fn listen(&mut self) -> Result<SocketAddr, ProxyError> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => self.bind().await?,
        };

        let addr = listener.local_addr().map_err(|source| ProxyError::Bind {
            addr: self.config.listen_addr.clone(),
            source,
        });
        self.listener = Some(listener);
        addr
    }

    async fn bind(&self) -> Result<TcpListener, ProxyError> {
        let addr = &self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.clone(),
                source,
            })?;

        if let Ok(local) = listener.local_addr() {
            info!(addr = %local, max_clients = self.config.max_clients, "Listening");
        }
        Ok(listener)
    }

    pub fn registry(&self) -> RegistryHandle {
        self.registry.clone()
    }

    /// Accept and serve clients until a fatal error occurs.
    pub async fn run(mut self) -> Result<(), ProxyError> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => self.bind().await?,
        };
        let ceiling = self.config.max_clients;

        loop {
            tokio::select! {
                biased;

                Some(fatal) = self.fatal_rx.recv() => {
                    error!(error = %fatal, "Fatal error, stopping proxy");
                    return Err(fatal);
                }

                admitted = admit(&listener, &self.registry, ceiling) => {
                    let Some((stream, peer)) = admitted.inspect_err(|e| {
                        error!(error = %e, "Listener failed");
                    })?
                    else {
                        continue;
                    };

                    debug!(peer = %peer, "Accepted connection");
                    tokio::spawn(handle_client(stream, peer, Arc::clone(&self.shared)));
                }
            }
        }
    }
}

/// Accept one connection once the registry is below `ceiling`.
///
/// Returns `None` if the registry fills up while waiting in accept, so the caller
/// goes back to waiting for room instead of admitting past the ceiling.
async fn admit(
    listener: &TcpListener,
    registry: &RegistryHandle,
    ceiling: usize,
) -> Result<Option<(TcpStream, SocketAddr)>, ProxyError> {
    let size = registry.wait_below(ceiling).await?;
    debug!(size, ceiling, "Admitting");

    tokio::select! {
        biased;

        full = registry.wait_until(|n| n >= ceiling) => {
            full?;
            Ok(None)
        }
        accepted = listener.accept() => accepted.map(Some).map_err(ProxyError::Accept),
    }
}

/// Request dispatcher for one accepted connection
async fn handle_client(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let mut client = Client::new(stream, peer.to_string());

    // Unparsed connections are never registered
    if let Err(e) = client.read_request(shared.request_timeout).await {
        debug!(peer = %peer, error = %e, "No valid request, closing");
        return;
    }

    if let Some(head) = client.request() {
        debug!(peer = %peer, method = %head.method, target = %head.target, "Request parsed");
    }

    if let Err(e) = shared.registry.publish(client.connect()).await {
        let _ = shared.fatal.send(e);
        return;
    }

    let result = handlers::dispatch(&mut client, &shared.handlers).await;

    if let Err(e) = shared.registry.publish(client.disconnect()).await {
        let _ = shared.fatal.send(e);
    }
    drop(client);

    match result {
        Ok(()) => {}
        Err(e) if e.is_fatal() => {
            error!(peer = %peer, error = %e, "Fatal connection error");
            if let Some(fatal) = e.into_fatal() {
                let _ = shared.fatal.send(fatal);
            }
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "Connection closed without response");
        }
    }
}
