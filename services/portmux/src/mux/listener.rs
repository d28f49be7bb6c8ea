//! TCP listener and connection handling.
//!
//! This module accepts connections on the public port and runs the
//! per-connection pipeline in its own task:
//! - Buffer until the PROXY header is stripped or known to be absent
//! - Classify the payload by its first byte
//! - Forward to the plaintext or TLS backend and splice
//!
//! Failures stay scoped to the connection that caused them.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::classify::Target;
use super::forward::{self, Backends, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT};
use super::pending::{HeaderLimits, PendingConnection};
use super::preview::{BytePreview, DEFAULT_PREVIEW_LEN};
use super::proxy_protocol::ProxyVersion;
use crate::error::{MuxError, Result};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Backends connections are forwarded to.
    pub backends: Backends,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Bounds on PROXY header disambiguation.
    pub header_limits: HeaderLimits,
    /// Connect timeout for backend connections.
    pub connect_timeout: Duration,
    /// Idle timeout for spliced connections.
    pub idle_timeout: Option<Duration>,
    /// Log a byte preview and the stripped header for every connection.
    pub debug: bool,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr, backends: Backends) -> Self {
        Self {
            bind_addr,
            backends,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            header_limits: HeaderLimits::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            debug: false,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// PROXY v1 headers stripped.
    pub proxy_v1_stripped: AtomicU64,
    /// PROXY v2 headers stripped.
    pub proxy_v2_stripped: AtomicU64,
    /// Connections without a PROXY header.
    pub passthrough: AtomicU64,
    /// Header timeouts and oversized headers.
    pub header_rejected: AtomicU64,
    /// Clients that closed before the header was resolved.
    pub closed_before_header: AtomicU64,
    /// Connections routed to the TLS backend.
    pub routed_tls: AtomicU64,
    /// Connections routed to the plaintext backend.
    pub routed_plain: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes proxied to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    fn record_failure(&self, err: &MuxError) {
        let counter = match err {
            MuxError::HeaderTimeout(_) | MuxError::HeaderTooLarge { .. } => &self.header_rejected,
            MuxError::ClosedBeforeHeader { .. } => &self.closed_before_header,
            MuxError::BackendUnreachable { .. } => &self.backend_failed,
            MuxError::Io(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The public TCP listener of the multiplexer.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the public port.
    pub async fn bind(config: ListenerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            plain_backend = %config.backends.plain,
            tls_backend = %config.backends.tls,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(
                                peer_addr = %peer_addr,
                                "Connection rejected: max connections reached"
                            );
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream).await {
                                stats.record_failure(&e);
                                log_connection_error(&e);
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(&self, client: TcpStream) -> Result<()> {
        let mut pending = PendingConnection::new(client);
        let target = pending.resolve(&self.config.header_limits).await?;

        match pending.header() {
            Some(header) => {
                let counter = match header.version {
                    ProxyVersion::V1 => &self.stats.proxy_v1_stripped,
                    ProxyVersion::V2 => &self.stats.proxy_v2_stripped,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                if self.config.debug {
                    info!(
                        version = %header.version,
                        header_len = header.len,
                        "Stripped PROXY header"
                    );
                }
            }
            None => {
                self.stats.passthrough.fetch_add(1, Ordering::Relaxed);
            }
        }

        let backend_addr = self.config.backends.addr_for(target);
        match target {
            Target::Tls => self.stats.routed_tls.fetch_add(1, Ordering::Relaxed),
            Target::Plain => self.stats.routed_plain.fetch_add(1, Ordering::Relaxed),
        };

        if self.config.debug {
            let preview = BytePreview::new(pending.prefix(), DEFAULT_PREVIEW_LEN);
            info!(
                route = %target,
                target_port = backend_addr.port(),
                hex = %preview.hex,
                ascii = %preview.ascii,
                "First bytes"
            );
        }

        let payload = pending.begin_forwarding();
        let splice = forward::forward(
            pending.stream_mut(),
            backend_addr,
            &payload,
            self.config.connect_timeout,
            self.config.idle_timeout,
        )
        .await?;

        self.stats
            .bytes_to_backend
            .fetch_add(splice.bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(splice.bytes_from_backend, Ordering::Relaxed);

        debug!(
            route = %target,
            bytes_to_backend = splice.bytes_to_backend,
            bytes_from_backend = splice.bytes_from_backend,
            "Connection closed"
        );

        Ok(())
    }
}

fn log_connection_error(err: &MuxError) {
    match err {
        MuxError::ClosedBeforeHeader { buffered } => {
            debug!(buffered = buffered, "Client closed before header was resolved");
        }
        _ if err.is_protocol_error() => {
            warn!(
                reason = err.reason_code(),
                error = %err,
                "Rejected connection: protocol error"
            );
        }
        MuxError::BackendUnreachable { .. } => {
            warn!(reason = err.reason_code(), error = %err, "Backend unreachable");
        }
        _ => {
            debug!(error = %err, "Connection error");
        }
    }
}
