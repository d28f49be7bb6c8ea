//! Human-readable previews of connection bytes for debug logging.

/// Number of bytes shown in a preview.
pub const DEFAULT_PREVIEW_LEN: usize = 16;

/// Hex and printable-ASCII rendering of the first bytes of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePreview {
    /// Space-separated lowercase hex, e.g. `16 03 01`.
    pub hex: String,
    /// Printable ASCII with every other byte shown as `.`.
    pub ascii: String,
}

impl BytePreview {
    /// Preview at most `max` bytes of `data`.
    pub fn new(data: &[u8], max: usize) -> Self {
        let slice = &data[..data.len().min(max)];

        let hex = slice
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");

        let ascii = slice
            .iter()
            .map(|&b| {
                if (0x20..=0x7E).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();

        Self { hex, ascii }
    }
}
