//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
///
/// Frame-layer errors (`BadMagic`, `UnsupportedVersion`, `InvalidFlags`,
/// `FrameTooLarge`, `CrcMismatch`) are fatal for the connection that
/// produced them. Payload-layer errors are fatal as well, except where a
/// peer chooses to answer with an `Error` frame instead.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame did not start with the AirUSB magic
    #[error("Bad frame magic: {0:#010x}")]
    BadMagic(u32),

    /// Frame carried an unknown protocol version
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Reserved flag bits were set
    #[error("Invalid frame flags: {0:#04x}")]
    InvalidFlags(u8),

    /// Frame payload exceeds the maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// CRC32 check failed
    #[error("CRC mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch { expected: u32, computed: u32 },

    /// Unknown message type byte
    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// A frame of an unexpected kind arrived during a synchronous wait
    #[error("Unexpected message: got {got:#04x}, expected {expected:#04x}")]
    UnexpectedMessage { got: u8, expected: u8 },

    /// Response sequence did not echo the request sequence
    #[error("Sequence mismatch: got {got}, expected {expected}")]
    SequenceMismatch { got: u32, expected: u32 },

    /// Payload too small for its declared shape
    #[error("Payload too small: needed {needed} bytes, got {available}")]
    PayloadTooSmall { needed: usize, available: usize },

    /// A field held a value outside its domain
    #[error("Invalid {field} value: {value}")]
    InvalidValue { field: &'static str, value: u32 },

    /// Compressed payload could not be decoded
    #[error("Decompression failed: {0}")]
    Decompress(String),

    /// Bulk stream framing violation (bad offset, wrong stream id, overrun)
    #[error("Bulk stream error: {0}")]
    BulkStream(String),

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::BadMagic(0xdeadbeef);
        assert!(format!("{}", err).contains("0xdeadbeef"));

        let err = ProtocolError::FrameTooLarge {
            size: 20_000_000,
            max: 16_777_216,
        };
        assert!(format!("{}", err).contains("Frame too large"));
    }

    #[test]
    fn test_crc_mismatch_display() {
        let err = ProtocolError::CrcMismatch {
            expected: 0x1234,
            computed: 0x5678,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("0x00001234"));
        assert!(msg.contains("0x00005678"));
    }
}
