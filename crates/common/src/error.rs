//! Common error types

use thiserror::Error;

/// Application-level errors shared by the server and client binaries
///
/// Wire-level failures live in `protocol::ProtocolError`; this type
/// covers everything above the frame codec.
#[derive(Debug, Error)]
pub enum Error {
    /// USB backend or device-state failure
    #[error("USB error: {0}")]
    Usb(String),

    /// Connection or transport failure
    #[error("Network error: {0}")]
    Network(String),

    /// Bad or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
