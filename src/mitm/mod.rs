//! TLS interception
//!
//! - Host selection for interception
//! - Client-facing and upstream TLS configuration
//! - The interception flow itself, run in place of a passthrough tunnel

pub mod interceptor;
pub mod matcher;
pub mod tls_config;

pub use interceptor::MitmInterceptor;
pub use matcher::HostMatcher;
pub use tls_config::{ClientTlsConfig, TlsConfigError};
