//! Single-port TCP multiplexer.
//!
//! This module provides:
//! - PROXY protocol v1/v2 header stripping
//! - First-byte classification (TLS handshake vs plaintext)
//! - Bounded per-connection buffering
//! - Backend forwarding and bidirectional splicing
//! - TCP listener management
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Pending buffer -> Header Stripper -> Classifier -> Forwarder -> Backend
//!                                                                              |
//!                                                             plaintext or TLS loopback listener
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use portmux::{Backends, Listener, ListenerConfig};
//!
//! let config = ListenerConfig::new("0.0.0.0:4000".parse()?, Backends::loopback(4001, 4002));
//! let listener = Arc::new(Listener::bind(config).await?);
//! listener.run().await?;
//! ```

mod classify;
mod forward;
mod listener;
mod pending;
mod preview;
mod proxy_protocol;

pub use classify::{classify, Target, TLS_HANDSHAKE_RECORD};
pub use forward::{
    connect_backend, forward, splice, Backends, SpliceStats, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_IDLE_TIMEOUT,
};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use pending::{
    ConnState, HeaderLimits, PendingConnection, StrippedHeader, DEFAULT_HEADER_TIMEOUT,
    DEFAULT_MAX_HEADER_BYTES,
};
pub use preview::{BytePreview, DEFAULT_PREVIEW_LEN};
pub use proxy_protocol::{
    strip_proxy_header, ProxyVersion, StripOutcome, MAX_V2_HEADER_LEN, MIN_DECISION_BYTES,
};
