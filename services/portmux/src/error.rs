//! Error types for the multiplexer core.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Per-connection failures. None of these ever stop the listener.
#[derive(Debug, Error)]
pub enum MuxError {
    /// PROXY header disambiguation did not finish in time.
    #[error("header_timeout: no decision after {0:?}")]
    HeaderTimeout(Duration),

    /// The header buffer filled up while the stripper still needed more bytes.
    #[error("header_too_large: {buffered} bytes buffered without a decision")]
    HeaderTooLarge { buffered: usize },

    /// Client went away before the header could be disambiguated.
    #[error("closed_before_header: client closed after {buffered} bytes")]
    ClosedBeforeHeader { buffered: usize },

    /// Connecting to the selected backend failed or timed out.
    #[error("backend_unreachable: {addr}")]
    BackendUnreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// I/O error on either side of the connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl MuxError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            MuxError::HeaderTimeout(_) => "header_timeout",
            MuxError::HeaderTooLarge { .. } => "header_too_large",
            MuxError::ClosedBeforeHeader { .. } => "closed_before_header",
            MuxError::BackendUnreachable { .. } => "backend_unreachable",
            MuxError::Io(_) => "io_error",
        }
    }

    /// Whether the client violated the header bounds.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            MuxError::HeaderTimeout(_) | MuxError::HeaderTooLarge { .. }
        )
    }
}

/// Convenience alias for multiplexer results.
pub type Result<T> = std::result::Result<T, MuxError>;
