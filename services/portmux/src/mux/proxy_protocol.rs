//! PROXY protocol header stripping.
//!
//! Load balancers may prepend a PROXY header to the client stream. This
//! module recognizes a v1 (text) or v2 (binary) header at the start of the
//! buffered bytes and reports how much of the buffer it occupies. Header
//! contents are never interpreted beyond locating the end of the header.
//!
//! Wire format (HAProxy PROXY protocol, versions 1 and 2):
//! - v1: `PROXY <INET> <src-ip> <dst-ip> <src-port> <dst-port>\r\n`
//! - v2: 12 bytes signature, 1 byte version and command, 1 byte address
//!   family and transport, 2 bytes trailer length, variable trailer

/// PROXY protocol v1 prefix.
const PROXY_V1_PREFIX: &[u8; 6] = b"PROXY ";

/// PROXY protocol v2 signature (12 bytes).
const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Fixed part of a v2 header: signature + version/command + family + length.
const PROXY_V2_FIXED_LEN: usize = 16;

/// Bytes needed to rule out both header formats.
pub const MIN_DECISION_BYTES: usize = PROXY_V2_SIGNATURE.len();

/// Largest header the v2 length field can describe.
pub const MAX_V2_HEADER_LEN: usize = PROXY_V2_FIXED_LEN + u16::MAX as usize;

/// PROXY protocol version of a stripped header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVersion {
    V1,
    V2,
}

impl std::fmt::Display for ProxyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyVersion::V1 => write!(f, "v1"),
            ProxyVersion::V2 => write!(f, "v2"),
        }
    }
}

/// Result of running the stripper over the bytes buffered so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripOutcome<'a> {
    /// Not enough bytes to decide; read more and retry with the larger buffer.
    Incomplete,
    /// A PROXY header was recognized and fully consumed.
    Stripped {
        version: ProxyVersion,
        /// Number of header bytes removed from the front of the buffer.
        header_len: usize,
        /// Every byte after the header.
        remainder: &'a [u8],
    },
    /// No PROXY header present; the buffer is returned unchanged.
    PassThrough(&'a [u8]),
}

/// Strip a leading PROXY v1 or v2 header from `buf`.
///
/// v1 is checked first, then v2. Without either signature the decision
/// waits until [`MIN_DECISION_BYTES`] bytes are buffered.
pub fn strip_proxy_header(buf: &[u8]) -> StripOutcome<'_> {
    if buf.starts_with(PROXY_V1_PREFIX) {
        return match find_crlf(buf) {
            Some(end) => {
                let header_len = end + 2;
                StripOutcome::Stripped {
                    version: ProxyVersion::V1,
                    header_len,
                    remainder: &buf[header_len..],
                }
            }
            None => StripOutcome::Incomplete,
        };
    }

    if buf.starts_with(&PROXY_V2_SIGNATURE) {
        if buf.len() < PROXY_V2_FIXED_LEN {
            return StripOutcome::Incomplete;
        }
        let trailer_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
        let header_len = PROXY_V2_FIXED_LEN + trailer_len;
        if buf.len() < header_len {
            return StripOutcome::Incomplete;
        }
        return StripOutcome::Stripped {
            version: ProxyVersion::V2,
            header_len,
            remainder: &buf[header_len..],
        };
    }

    if buf.len() < MIN_DECISION_BYTES {
        return StripOutcome::Incomplete;
    }

    StripOutcome::PassThrough(buf)
}

/// Position of the first `\r\n` in `buf`.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
