//! Wire protocol for AirUSB
//!
//! This crate defines the framed message protocol spoken between the
//! AirUSB server and client: a 20-byte CRC-protected envelope carrying
//! device enumeration, attach/detach control and URB traffic, tuned
//! for large MTUs and bulk streaming on fast wireless links.
//!
//! # Example
//!
//! ```
//! use protocol::{encode_frame, read_frame, CodecConfig, Envelope, Message};
//! use std::io::Cursor;
//!
//! let request = Envelope::new(7, Message::DeviceListRequest);
//! let frame = encode_frame(&request).unwrap();
//!
//! let decoded = read_frame(&mut Cursor::new(frame), &CodecConfig::default()).unwrap();
//! assert_eq!(decoded.sequence, 7);
//! assert_eq!(decoded.message, Message::DeviceListRequest);
//! ```

pub mod bulk;
pub mod codec;
pub mod compress;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{
    encode_frame, encode_frame_with, read_frame, write_frame, CodecConfig, Envelope, FLAG_COMPRESSED,
    FRAME_MAGIC, HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};
pub use compress::{compress, decompress, Algorithm};
pub use error::{ProtocolError, Result};
pub use messages::{Message, MessageKind};
pub use types::{BulkDataHeader, DeviceRecord, Direction, TransferKind, UrbHeader};

/// Default TCP port the server listens on
pub const DEFAULT_PORT: u16 = 3240;
