//! Byte-stream compression for bulk payloads
//!
//! Compression is stateless per frame: no dictionaries or streaming
//! context survive across calls. LZ4 uses the size-prepended block
//! format so a chunk decompresses without out-of-band length
//! information; zstd frames carry their own size.

use crate::error::{ProtocolError, Result};

/// Compression algorithm tag
///
/// The tag value is carried in [`crate::types::BulkDataHeader`] and is
/// part of the wire contract.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// No compression, bytes pass through untouched
    None = 0,
    /// LZ4 block format, fast path for real-time data
    #[default]
    Lz4 = 1,
    /// zstd, better ratio for large bulk streams
    Zstd = 2,
}

impl TryFrom<u8> for Algorithm {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Zstd),
            _ => Err(ProtocolError::InvalidValue {
                field: "compression algorithm",
                value: value as u32,
            }),
        }
    }
}

/// Compress a byte slice with the given algorithm
pub fn compress(data: &[u8], algorithm: Algorithm) -> Result<Vec<u8>> {
    match algorithm {
        Algorithm::None => Ok(data.to_vec()),
        Algorithm::Lz4 => Ok(lz4_flex::block::compress_prepend_size(data)),
        Algorithm::Zstd => {
            zstd::stream::encode_all(data, 0).map_err(|e| ProtocolError::Decompress(e.to_string()))
        }
    }
}

/// Decompress a byte slice produced by [`compress`]
///
/// A truncated or corrupt stream surfaces as
/// [`ProtocolError::Decompress`]; callers treat the enclosing frame as
/// an error.
pub fn decompress(data: &[u8], algorithm: Algorithm) -> Result<Vec<u8>> {
    match algorithm {
        Algorithm::None => Ok(data.to_vec()),
        Algorithm::Lz4 => lz4_flex::block::decompress_size_prepended(data)
            .map_err(|e| ProtocolError::Decompress(e.to_string())),
        Algorithm::Zstd => {
            zstd::stream::decode_all(data).map_err(|e| ProtocolError::Decompress(e.to_string()))
        }
    }
}
