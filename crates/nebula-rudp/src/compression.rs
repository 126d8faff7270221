//! Optional LZ4 compression of whole datagrams.
//!
//! Every datagram starts with a flag byte saying whether the rest is LZ4
//! compressed. Small datagrams, and datagrams that would not shrink, are
//! sent as-is.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

/// Compression flag: datagram body is uncompressed.
pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Compression flag: datagram body is LZ4-compressed with a little-endian
/// `u32` size prefix.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// Controls when datagrams are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum body size (bytes) before compression is tried. Default: 64.
    pub threshold: usize,
    /// Whether compression is enabled at all. Default: false.
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 64,
            enabled: false,
        }
    }
}

/// Prefix `data` with a compression flag, compressing it when enabled and
/// worthwhile.
pub fn compress_datagram(data: &[u8], config: &CompressionConfig) -> Vec<u8> {
    if config.enabled && data.len() >= config.threshold {
        let compressed = compress_prepend_size(data);
        if compressed.len() < data.len() {
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(COMPRESSION_FLAG_LZ4);
            out.extend_from_slice(&compressed);
            return out;
        }
    }
    let mut out = Vec::with_capacity(1 + data.len());
    out.push(COMPRESSION_FLAG_NONE);
    out.extend_from_slice(data);
    out
}

/// Strip the flag byte and decompress if necessary. The declared
/// decompressed size must not exceed `max_len`.
pub fn decompress_datagram(data: &[u8], max_len: usize) -> Result<Vec<u8>, CompressionError> {
    let (&flag, body) = data.split_first().ok_or(CompressionError::EmptyPayload)?;
    match flag {
        COMPRESSION_FLAG_NONE => Ok(body.to_vec()),
        COMPRESSION_FLAG_LZ4 => {
            let declared = body
                .get(..4)
                .map(|prefix| u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]))
                .ok_or_else(|| CompressionError::DecompressFailed("missing size prefix".into()))?;
            if declared as usize > max_len {
                return Err(CompressionError::TooLarge {
                    size: declared as usize,
                    max: max_len,
                });
            }
            decompress_size_prepended(body)
                .map_err(|e| CompressionError::DecompressFailed(e.to_string()))
        }
        flag => Err(CompressionError::UnknownFlag(flag)),
    }
}

/// Errors that can occur while unwrapping a datagram.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The datagram was empty, so there is no flag byte.
    #[error("empty payload, no compression flag")]
    EmptyPayload,
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    /// The size prefix announces more data than a datagram may hold.
    #[error("decompressed size {size} exceeds {max}")]
    TooLarge { size: usize, max: usize },
    /// An unknown compression flag byte was encountered.
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),
}
