//! Multiplexer configuration.
//!
//! Backend ports default to the public port + 1 (plaintext) and + 2 (TLS).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use portmux::mux::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEADER_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_HEADER_BYTES, MAX_V2_HEADER_LEN,
};
use portmux::{Backends, HeaderLimits, ListenerConfig};

/// Public port used when neither `MUX_LISTEN_ADDR` nor `PORT` is set.
const DEFAULT_PORT: u16 = 4000;

/// Smallest accepted header buffer (a full v2 fixed header).
const MIN_HEADER_BYTES: usize = 16;

/// Multiplexer configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Public address to accept connections on.
    pub listen_addr: SocketAddr,

    /// Backend host (loopback by default).
    pub backend_host: IpAddr,

    /// Plaintext backend port.
    pub plain_port: u16,

    /// TLS backend port.
    pub tls_port: u16,

    /// Maximum time to resolve the PROXY header.
    pub header_timeout: Duration,

    /// Maximum bytes buffered while resolving the PROXY header.
    pub max_header_bytes: usize,

    /// Backend connect timeout.
    pub connect_timeout: Duration,

    /// Optional idle timeout for spliced connections.
    pub idle_timeout: Option<Duration>,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Log byte previews and stripped headers.
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = match lookup("MUX_LISTEN_ADDR") {
            Some(addr) => addr
                .trim()
                .parse::<SocketAddr>()
                .context("MUX_LISTEN_ADDR must be a socket address (example: 0.0.0.0:4000).")?,
            None => {
                let port: u16 = parse_var(&lookup, "PORT", "PORT must be a port number.")?
                    .unwrap_or(DEFAULT_PORT);
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
            }
        };

        let backend_host: IpAddr = parse_var(
            &lookup,
            "MUX_BACKEND_HOST",
            "MUX_BACKEND_HOST must be an IP address.",
        )?
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let plain_port: u16 = match parse_var(
            &lookup,
            "MUX_PLAIN_PORT",
            "MUX_PLAIN_PORT must be a port number.",
        )? {
            Some(port) => port,
            None => offset_port(listen_addr.port(), 1)?,
        };

        let tls_port: u16 = match parse_var(
            &lookup,
            "MUX_TLS_PORT",
            "MUX_TLS_PORT must be a port number.",
        )? {
            Some(port) => port,
            None => offset_port(listen_addr.port(), 2)?,
        };

        let header_timeout = millis_var(
            &lookup,
            "MUX_HEADER_TIMEOUT_MS",
            "MUX_HEADER_TIMEOUT_MS must be an integer (milliseconds).",
        )?
        .map(|ms| Duration::from_millis(ms.max(10)))
        .unwrap_or(DEFAULT_HEADER_TIMEOUT);

        let max_header_bytes: usize = parse_var(
            &lookup,
            "MUX_MAX_HEADER_BYTES",
            "MUX_MAX_HEADER_BYTES must be an integer.",
        )?
        .unwrap_or(DEFAULT_MAX_HEADER_BYTES)
        .clamp(MIN_HEADER_BYTES, MAX_V2_HEADER_LEN);

        let connect_timeout = millis_var(
            &lookup,
            "MUX_CONNECT_TIMEOUT_MS",
            "MUX_CONNECT_TIMEOUT_MS must be an integer (milliseconds).",
        )?
        .map(|ms| Duration::from_millis(ms.max(10)))
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let idle_timeout = millis_var(
            &lookup,
            "MUX_IDLE_TIMEOUT_MS",
            "MUX_IDLE_TIMEOUT_MS must be an integer (milliseconds).",
        )?
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis);

        let max_connections: usize = parse_var(
            &lookup,
            "MUX_MAX_CONNECTIONS",
            "MUX_MAX_CONNECTIONS must be an integer.",
        )?
        .unwrap_or(DEFAULT_MAX_CONNECTIONS)
        .max(1);

        let debug = lookup("MUX_DEBUG")
            .or_else(|| lookup("DEBUG_MUX"))
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let log_level = lookup("MUX_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            backend_host,
            plain_port,
            tls_port,
            header_timeout,
            max_header_bytes,
            connect_timeout,
            idle_timeout,
            max_connections,
            debug,
            log_level,
        })
    }

    /// Listener configuration for the multiplexer core.
    pub fn listener_config(&self) -> ListenerConfig {
        let backends = Backends::on_host(self.backend_host, self.plain_port, self.tls_port);
        let mut config = ListenerConfig::new(self.listen_addr, backends);
        config.max_connections = self.max_connections;
        config.header_limits = HeaderLimits {
            timeout: self.header_timeout,
            max_bytes: self.max_header_bytes,
        };
        config.connect_timeout = self.connect_timeout;
        config.idle_timeout = self.idle_timeout;
        config.debug = self.debug;
        config
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, message: &'static str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .context(message)
}

fn millis_var<F>(lookup: &F, key: &str, message: &'static str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    parse_var(lookup, key, message)
}

fn offset_port(port: u16, offset: u16) -> Result<u16> {
    port.checked_add(offset).with_context(|| {
        format!(
            "Listen port {} leaves no room for backend port +{}. \
             Set MUX_PLAIN_PORT and MUX_TLS_PORT.",
            port, offset
        )
    })
}
