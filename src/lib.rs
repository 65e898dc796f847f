//! Mitmgate - Forward HTTP/HTTPS proxy with optional TLS interception
//!
//! ## Features
//!
//! - **Forwarding**: `GET` and `POST` re-issued upstream, responses streamed back
//! - **Tunneling**: `CONNECT` relayed byte-for-byte in both directions
//! - **TLS Interception**: selected `CONNECT` hosts terminated with a provisioned
//!   identity, re-originated over a fresh TLS session
//! - **Admission Control**: at most 32 registered clients by default
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mitmgate::{Proxy, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = Proxy::new(ProxyConfig::new("127.0.0.1", 8080))?;
//!     proxy.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `server` - Listener, admission loop and request dispatch
//! - `registry` - Single-owner record of connected clients
//! - `handlers` - One handler per supported method
//! - `relay` - Tunnel relay and response streaming
//! - `mitm` - TLS interception

// Core proxy modules
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod http_client;
pub mod registry;
pub mod relay;
pub mod request;
pub mod server;

// TLS interception
pub mod mitm;
pub mod tls;

// Re-export commonly used types

/// Configuration types
pub use config::{InterceptConfig, ProxyConfig};

/// Errors
pub use error::{ConnectionError, ProxyError};

/// Engine
pub use registry::{ClientState, Lifecycle, RegistryEntry, RegistryHandle};
pub use server::Proxy;

/// Server identity input
pub use tls::{IdentityProvider, PemIdentity, ServerIdentity, TlsError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
