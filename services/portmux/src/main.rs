//! portmux
//!
//! Single-port TCP multiplexer in front of a plaintext and a TLS listener.
//!
//! This service:
//! - Accepts TCP connections on one public port
//! - Strips an optional PROXY protocol v1/v2 header
//! - Routes TLS handshakes to the TLS backend and everything else to the
//!   plaintext backend
//! - Splices the connection to the selected loopback backend

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portmux::Listener;

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MUX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting portmux");
    info!(
        listen_addr = %config.listen_addr,
        backend_host = %config.backend_host,
        plain_port = config.plain_port,
        tls_port = config.tls_port,
        header_timeout_ms = config.header_timeout.as_millis() as u64,
        max_header_bytes = config.max_header_bytes,
        debug = config.debug,
        "Configuration loaded"
    );

    let listener = Listener::bind(config.listener_config())
        .await
        .with_context(|| format!("Failed to bind listener on {}", config.listen_addr))?;
    let listener = Arc::new(listener);

    let listener_handle = tokio::spawn({
        let listener = Arc::clone(&listener);
        async move { listener.run().await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = listener_handle => {
            match result {
                Ok(Ok(())) => info!("Listener exited normally"),
                Ok(Err(e)) => error!(error = %e, "Listener error"),
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }
    }

    let stats = listener.stats();
    info!(
        connections_accepted = stats.connections_accepted.load(Ordering::Relaxed),
        connections_active = stats.connections_active.load(Ordering::Relaxed),
        "portmux shutdown complete"
    );
    Ok(())
}
