//! AirUSB client library
//!
//! Connects to an AirUSB server, tracks attached devices as
//! [`virtual_usb::VirtualDevice`]s and dispatches URB completions to a
//! local device sink.

pub mod network;
pub mod virtual_usb;

pub use network::client::UsbClient;
pub use virtual_usb::device::{Completion, VirtualDevice};
pub use virtual_usb::sink::{spawn_response_handler, DeviceSink};
