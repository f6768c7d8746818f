//! Client session management
//!
//! Connection establishment, synchronous request/response for the
//! control operations, and the background reader that dispatches URB
//! completions to virtual devices.

use crate::network::{socket, SessionShared};
use crate::virtual_usb::device::VirtualDevice;
use common::Error;
use protocol::{read_frame, CodecConfig, DeviceRecord, Envelope, Message, MessageKind};
use std::collections::HashMap;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Completion status reported locally when the connection drops with
/// URBs still in flight (ECONNRESET)
const STATUS_CONNECTION_LOST: i32 = -104;

/// A session with one AirUSB server
pub struct UsbClient {
    read_stream: TcpStream,
    shared: Arc<SessionShared>,
    devices: Arc<Mutex<HashMap<u32, Arc<VirtualDevice>>>>,
    reader: Option<JoinHandle<()>>,
}

impl UsbClient {
    /// Connect to a server and tune the socket
    ///
    /// Any socket error is reported; there are no silent retries.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> common::Result<Self> {
        Self::connect_with(addr, CodecConfig::default())
    }

    /// Connect with an explicit codec configuration
    pub fn connect_with<A: ToSocketAddrs>(addr: A, codec: CodecConfig) -> common::Result<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| Error::Network(format!("Connect failed: {}", e)))?;
        socket::tune_stream(&stream)
            .map_err(|e| Error::Network(format!("Socket tuning failed: {}", e)))?;
        let read_stream = stream
            .try_clone()
            .map_err(|e| Error::Network(format!("Socket clone failed: {}", e)))?;

        info!("Connected to AirUSB server at {:?}", stream.peer_addr());
        Ok(Self {
            read_stream,
            shared: Arc::new(SessionShared::new(stream, codec)),
            devices: Arc::new(Mutex::new(HashMap::new())),
            reader: None,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Fetch the server's current inventory
    pub fn list_devices(&mut self) -> common::Result<Vec<DeviceRecord>> {
        let envelope = self.request(Message::DeviceListRequest, MessageKind::DeviceListResponse)?;
        match envelope.message {
            Message::DeviceListResponse { devices } => Ok(devices),
            _ => unreachable!("request() validated the message kind"),
        }
    }

    /// Attach a device from a previously fetched inventory record
    ///
    /// On success the device is tracked as a [`VirtualDevice`] ready
    /// for URB submission. Attaching a device this session already
    /// holds returns the existing virtual device.
    pub fn attach(&mut self, record: &DeviceRecord) -> common::Result<Arc<VirtualDevice>> {
        let device_id = record.device_id;
        if let Some(existing) = self.devices.lock().unwrap().get(&device_id) {
            return Ok(Arc::clone(existing));
        }

        let envelope = self.request(
            Message::DeviceAttachRequest { device_id },
            MessageKind::DeviceAttachResponse,
        )?;
        match envelope.message {
            Message::DeviceAttachResponse { success: true } => {}
            _ => {
                return Err(Error::Usb(format!(
                    "Server refused to attach device {} (busid {})",
                    device_id, record.busid
                )))
            }
        }

        let device = VirtualDevice::new(record.clone(), Arc::clone(&self.shared));
        self.devices
            .lock()
            .unwrap()
            .insert(device_id, Arc::clone(&device));
        info!(device_id, busid = %record.busid, "Device attached");
        Ok(device)
    }

    /// Detach a device; unknown ids succeed (the server is idempotent)
    pub fn detach(&mut self, device_id: u32) -> common::Result<bool> {
        let envelope = self.request(
            Message::DeviceDetachRequest { device_id },
            MessageKind::DeviceDetachResponse,
        )?;
        let success = matches!(envelope.message, Message::DeviceDetachResponse { success: true });

        if let Some(device) = self.devices.lock().unwrap().remove(&device_id) {
            device.fail_pending(STATUS_CONNECTION_LOST);
        }
        Ok(success)
    }

    /// Devices currently attached through this session
    pub fn attached_devices(&self) -> Vec<Arc<VirtualDevice>> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    /// Start the background completion reader
    ///
    /// After this, the synchronous operations (`list_devices`,
    /// `attach`, `detach`) are no longer available on this session;
    /// the reader owns the receive side.
    pub fn start_reader(&mut self) -> common::Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }

        let stream = self
            .read_stream
            .try_clone()
            .map_err(|e| Error::Network(format!("Socket clone failed: {}", e)))?;
        let shared = Arc::clone(&self.shared);
        let devices = Arc::clone(&self.devices);

        let handle = thread::Builder::new()
            .name("completion-reader".to_string())
            .spawn(move || read_loop(stream, shared, devices))
            .map_err(|e| Error::Other(format!("Failed to spawn reader: {}", e)))?;
        self.reader = Some(handle);
        Ok(())
    }

    /// Disconnect from the server
    ///
    /// Issues a best-effort detach for every attached device, stops
    /// the reader and closes the socket. Outstanding URBs complete
    /// locally with a connection-lost status.
    pub fn disconnect(&mut self) {
        let devices: Vec<u32> = self.devices.lock().unwrap().keys().copied().collect();
        for device_id in devices {
            if let Err(e) = self
                .shared
                .send(Message::DeviceDetachRequest { device_id })
            {
                debug!(device_id, "Detach on disconnect failed: {}", e);
            }
        }

        let _ = self.read_stream.shutdown(Shutdown::Read);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }

        self.shared.mark_disconnected();
        for device in self.devices.lock().unwrap().values() {
            device.fail_pending(STATUS_CONNECTION_LOST);
        }
        self.devices.lock().unwrap().clear();

        let _ = self.read_stream.shutdown(Shutdown::Both);
        info!("Disconnected from AirUSB server");
    }

    /// One synchronous request/response exchange
    ///
    /// The response must carry the expected kind and echo the request
    /// sequence; anything else is a protocol violation that closes the
    /// connection.
    fn request(&mut self, message: Message, expected: MessageKind) -> common::Result<Envelope> {
        if self.reader.is_some() {
            return Err(Error::Other(
                "Synchronous request while the completion reader is running".to_string(),
            ));
        }
        if !self.shared.is_connected() {
            return Err(Error::Network("Not connected".to_string()));
        }

        let sequence = self.shared.send(message)?;
        let envelope = read_frame(&mut self.read_stream, &self.shared.codec).map_err(|e| {
            self.fail_connection();
            Error::Network(format!("Receive failed: {}", e))
        })?;

        if envelope.message.kind() != expected {
            self.fail_connection();
            return Err(Error::Network(format!(
                "Unexpected response type {:#04x} (expected {:#04x})",
                envelope.message.kind() as u8,
                expected as u8
            )));
        }
        if envelope.sequence != sequence {
            self.fail_connection();
            return Err(Error::Network(format!(
                "Response sequence {} does not match request {}",
                envelope.sequence, sequence
            )));
        }
        Ok(envelope)
    }

    fn fail_connection(&self) {
        self.shared.mark_disconnected();
        let _ = self.read_stream.shutdown(Shutdown::Both);
    }
}

impl Drop for UsbClient {
    fn drop(&mut self) {
        if self.shared.is_connected() {
            self.disconnect();
        }
    }
}

/// Background reader: drain frames, route completions
fn read_loop(
    mut stream: TcpStream,
    shared: Arc<SessionShared>,
    devices: Arc<Mutex<HashMap<u32, Arc<VirtualDevice>>>>,
) {
    loop {
        let envelope = match read_frame(&mut stream, &shared.codec) {
            Ok(envelope) => envelope,
            Err(e) => {
                if shared.is_connected() {
                    debug!("Reader stopped: {}", e);
                }
                break;
            }
        };

        match envelope.message {
            Message::CompleteUrb { header, data } => {
                let device = devices.lock().unwrap().get(&header.device_id).cloned();
                match device {
                    Some(device) => device.complete(header, data),
                    None => warn!(
                        device_id = header.device_id,
                        urb_id = header.urb_id,
                        "Completion for unknown device dropped"
                    ),
                }
            }
            Message::Error { message } => {
                warn!("Server error: {}", message);
            }
            Message::DeviceDetachResponse { .. } => {
                // Response to a best-effort detach during disconnect.
                debug!("Detach acknowledged");
            }
            other => {
                warn!(
                    "Protocol violation: unexpected message type {:#04x} from server",
                    other.kind() as u8
                );
                let _ = stream.shutdown(Shutdown::Both);
                break;
            }
        }
    }

    shared.mark_disconnected();
    for device in devices.lock().unwrap().values() {
        device.fail_pending(STATUS_CONNECTION_LOST);
    }
}
