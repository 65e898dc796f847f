//! Client registry actor
//!
//! One owner task holds the list of connected clients. Everyone else talks to it
//! through a bounded mailbox and reads its size from a watch channel, so the
//! backing storage is never touched concurrently.

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Disconnected,
}

/// State transition published by a connection task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    pub peer: String,
    pub state: ClientState,
}

impl Lifecycle {
    pub fn connected(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            state: ClientState::Connected,
        }
    }

    pub fn disconnected(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            state: ClientState::Disconnected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub peer: String,
    pub state: ClientState,
}

enum Message {
    Lifecycle(Lifecycle),
    Snapshot(oneshot::Sender<Vec<RegistryEntry>>),
}

struct Registry {
    entries: Vec<RegistryEntry>,
    mailbox: mpsc::Receiver<Message>,
    size: watch::Sender<usize>,
}

impl Registry {
    async fn run(mut self) {
        while let Some(message) = self.mailbox.recv().await {
            match message {
                Message::Lifecycle(event) => {
                    self.apply(event);
                    self.size.send_replace(self.entries.len());
                }
                Message::Snapshot(reply) => {
                    let _ = reply.send(self.entries.clone());
                }
            }
        }

        debug!("Registry mailbox closed, owner task exiting");
    }

    fn apply(&mut self, event: Lifecycle) {
        let position = self.entries.iter().position(|e| e.peer == event.peer);

        match (event.state, position) {
            (ClientState::Connected, Some(i)) => {
                self.entries[i].state = ClientState::Connected;
            }
            (ClientState::Connected, None) => {
                self.entries.push(RegistryEntry {
                    peer: event.peer,
                    state: ClientState::Connected,
                });
            }
            (ClientState::Disconnected, Some(i)) => {
                // Order is not meaningful
                self.entries.swap_remove(i);
            }
            (ClientState::Disconnected, None) => {
                trace!(peer = %event.peer, "Disconnect for unknown peer ignored");
            }
        }
    }
}

/// Start the registry owner task. `capacity` bounds the mailbox.
pub fn spawn(capacity: usize) -> RegistryHandle {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (size_tx, size_rx) = watch::channel(0);

    let registry = Registry {
        entries: Vec::with_capacity(capacity),
        mailbox: rx,
        size: size_tx,
    };
    tokio::spawn(registry.run());

    RegistryHandle {
        mailbox: tx,
        size: size_rx,
    }
}

/// Cloneable access to the registry owner task
#[derive(Clone)]
pub struct RegistryHandle {
    mailbox: mpsc::Sender<Message>,
    size: watch::Receiver<usize>,
}

impl RegistryHandle {
    pub async fn publish(&self, event: Lifecycle) -> Result<(), ProxyError> {
        self.mailbox
            .send(Message::Lifecycle(event))
            .await
            .map_err(|_| ProxyError::RegistryClosed)
    }

    /// Size after the last applied message
    pub fn size(&self) -> usize {
        *self.size.borrow()
    }

    /// Wait until the size satisfies `predicate`, returning that size.
    pub async fn wait_until<F>(&self, mut predicate: F) -> Result<usize, ProxyError>
    where
        F: FnMut(usize) -> bool,
    {
        let mut size = self.size.clone();
        let current = size
            .wait_for(|n| predicate(*n))
            .await
            .map_err(|_| ProxyError::RegistryClosed)?;
        Ok(*current)
    }

    /// Admission gate: resolves once fewer than `ceiling` clients are registered.
    pub async fn wait_below(&self, ceiling: usize) -> Result<usize, ProxyError> {
        self.wait_until(|n| n < ceiling).await
    }

    /// Entries as of every message published before this call
    pub async fn snapshot(&self) -> Result<Vec<RegistryEntry>, ProxyError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Message::Snapshot(tx))
            .await
            .map_err(|_| ProxyError::RegistryClosed)?;
        rx.await.map_err(|_| ProxyError::RegistryClosed)
    }
}
