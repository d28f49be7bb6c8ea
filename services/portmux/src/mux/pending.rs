//! Per-connection buffering while the PROXY header is resolved.
//!
//! Bytes are accumulated into a bounded prefix buffer until the stripper can
//! decide. The whole wait is capped by a timeout and by the buffer size; a
//! client that exceeds either is rejected and nothing is forwarded.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::trace;

use super::classify::{classify, Target};
use super::proxy_protocol::{strip_proxy_header, ProxyVersion, StripOutcome};
use crate::error::{MuxError, Result};

/// Default time allowed for the header to be resolved.
pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on bytes buffered while the header is resolved.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8192;

/// Largest single read into the prefix buffer.
const READ_CHUNK: usize = 4096;

/// Bounds on header disambiguation.
#[derive(Debug, Clone)]
pub struct HeaderLimits {
    /// Maximum time to wait for the header and the first payload byte.
    pub timeout: Duration,
    /// Maximum bytes buffered before a decision.
    pub max_bytes: usize,
}

impl Default for HeaderLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HEADER_TIMEOUT,
            max_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

/// Lifecycle of a pending connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accumulating bytes until the stripper can decide.
    Buffering,
    /// Header resolved (stripped or absent); payload is ready to classify.
    Stripped,
    /// Payload handed to the forwarder; no further inspection.
    Forwarding,
}

/// A PROXY header removed from the front of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrippedHeader {
    pub version: ProxyVersion,
    pub len: usize,
}

/// An accepted client connection whose target is not yet known.
pub struct PendingConnection<S> {
    stream: S,
    /// Received bytes not yet forwarded, in arrival order.
    prefix: Vec<u8>,
    state: ConnState,
    header: Option<StrippedHeader>,
}

impl<S: AsyncRead + Unpin> PendingConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            prefix: Vec::new(),
            state: ConnState::Buffering,
            header: None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Bytes buffered and not yet forwarded.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// The stripped PROXY header, if one was present.
    pub fn header(&self) -> Option<StrippedHeader> {
        self.header
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Resolve the PROXY header and classify the payload.
    ///
    /// Returns once the header is stripped (or known to be absent) and at
    /// least one payload byte has arrived, or the client half-closed right
    /// after a header. Fails without touching any backend if the client
    /// closes while buffering or exceeds `limits`.
    pub async fn resolve(&mut self, limits: &HeaderLimits) -> Result<Target> {
        match timeout(limits.timeout, self.read_preamble(limits.max_bytes)).await {
            Ok(result) => result,
            Err(_) => Err(MuxError::HeaderTimeout(limits.timeout)),
        }
    }

    /// Hand the buffered payload over for forwarding.
    ///
    /// After this the connection is an uninterpreted pipe.
    pub fn begin_forwarding(&mut self) -> Vec<u8> {
        debug_assert_eq!(self.state, ConnState::Stripped);
        self.state = ConnState::Forwarding;
        std::mem::take(&mut self.prefix)
    }

    async fn read_preamble(&mut self, max_bytes: usize) -> Result<Target> {
        while self.state == ConnState::Buffering {
            match strip_proxy_header(&self.prefix) {
                StripOutcome::Incomplete => {
                    if self.prefix.len() >= max_bytes {
                        return Err(MuxError::HeaderTooLarge {
                            buffered: self.prefix.len(),
                        });
                    }
                    if self.fill(max_bytes).await? == 0 {
                        return Err(MuxError::ClosedBeforeHeader {
                            buffered: self.prefix.len(),
                        });
                    }
                }
                StripOutcome::Stripped {
                    version,
                    header_len,
                    ..
                } => {
                    self.prefix.drain(..header_len);
                    self.header = Some(StrippedHeader {
                        version,
                        len: header_len,
                    });
                    self.state = ConnState::Stripped;
                }
                StripOutcome::PassThrough(_) => {
                    self.state = ConnState::Stripped;
                }
            }
        }

        // A header may arrive on its own; the first payload byte decides the target.
        while self.prefix.is_empty() {
            if self.fill(max_bytes).await? == 0 {
                trace!("Client closed right after the PROXY header");
                break;
            }
        }

        Ok(classify(&self.prefix))
    }

    /// Read once from the client, appending to the prefix without exceeding `max_bytes`.
    async fn fill(&mut self, max_bytes: usize) -> Result<usize> {
        let start = self.prefix.len();
        let room = max_bytes.saturating_sub(start).min(READ_CHUNK);
        self.prefix.resize(start + room, 0);

        let n = match self.stream.read(&mut self.prefix[start..]).await {
            Ok(n) => n,
            Err(e) => {
                self.prefix.truncate(start);
                return Err(e.into());
            }
        };
        self.prefix.truncate(start + n);

        trace!(bytes_read = n, buffered = self.prefix.len(), "Read client bytes");
        Ok(n)
    }
}
