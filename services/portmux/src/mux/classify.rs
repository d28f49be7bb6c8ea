//! Backend selection from the first payload byte.
//!
//! This is a one-byte heuristic, not a handshake validator. Both backends
//! reject traffic they cannot parse.

/// TLS record content type for handshake messages.
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Which backend a connection is forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Plaintext application listener.
    Plain,
    /// TLS-terminating application listener.
    Tls,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Plain => "plain",
            Target::Tls => "tls",
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a post-strip payload. An empty payload goes to the plaintext backend.
pub fn classify(payload: &[u8]) -> Target {
    match payload.first() {
        Some(&TLS_HANDSHAKE_RECORD) => Target::Tls,
        _ => Target::Plain,
    }
}
