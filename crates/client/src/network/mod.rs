//! Network layer: connection, request correlation, completion reader

pub mod client;
pub mod socket;

use common::Error;
use protocol::{write_frame, CodecConfig, Envelope, Message};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Connection state shared between the client, its virtual devices and
/// the background reader
///
/// The write half is serialized by a mutex so synchronous requests and
/// URB submissions from device threads interleave at frame boundaries.
pub(crate) struct SessionShared {
    writer: Mutex<TcpStream>,
    sequence: AtomicU32,
    next_urb_id: AtomicU64,
    connected: AtomicBool,
    pub(crate) codec: CodecConfig,
}

impl SessionShared {
    pub(crate) fn new(stream: TcpStream, codec: CodecConfig) -> Self {
        Self {
            writer: Mutex::new(stream),
            sequence: AtomicU32::new(1),
            next_urb_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            codec,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Claim the next request sequence number
    pub(crate) fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Claim the next URB id (per-session counter, starts at 1)
    pub(crate) fn next_urb_id(&self) -> u64 {
        self.next_urb_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a message under a fresh sequence number
    pub(crate) fn send(&self, message: Message) -> common::Result<u32> {
        let sequence = self.next_sequence();
        self.send_with_sequence(sequence, message)?;
        Ok(sequence)
    }

    /// Send a message with an explicit sequence number
    pub(crate) fn send_with_sequence(&self, sequence: u32, message: Message) -> common::Result<()> {
        if !self.is_connected() {
            return Err(Error::Network("Not connected".to_string()));
        }
        let mut writer = self.writer.lock().unwrap();
        write_frame(&mut *writer, &Envelope::new(sequence, message))
            .map_err(|e| Error::Network(format!("Send failed: {}", e)))
    }
}
