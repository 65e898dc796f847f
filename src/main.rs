use anyhow::{Context, Result};
use tracing::{error, info};

use mitmgate::{Proxy, ProxyConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .json()
        .init();

    info!(version = mitmgate::VERSION, "Starting proxy");

    let config = ProxyConfig::from_env().context("Failed to load configuration")?;
    info!(
        listen = %config.listen_addr,
        intercept = config.intercept.enabled,
        "Configuration loaded"
    );

    let result = match Proxy::new(config) {
        Ok(proxy) => proxy.run().await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!(error = %e, code = e.exit_code(), "Proxy stopped");
        std::process::exit(e.exit_code());
    }

    Ok(())
}
