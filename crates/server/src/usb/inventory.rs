//! Device inventory
//!
//! The inventory owns every publishable device between attaches. An
//! attach moves logical ownership of one device to a client session;
//! the inventory keeps the entry for listing and takes ownership back
//! on detach or when the session dies.

use crate::net::SessionId;
use crate::usb::device::UsbDevice;
use protocol::DeviceRecord;
use rusb::{Context, UsbContext};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// USB hub device class, never exported
const CLASS_HUB: u8 = 9;
/// Linux Foundation vendor id: root hubs and virtual controllers
const VID_LINUX_FOUNDATION: u16 = 0x1d6b;

/// Attach failure reasons
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("Device {0} is not in the inventory")]
    UnknownDevice(u32),

    #[error("Device {0} is attached to another session")]
    AlreadyAttached(u32),

    #[error("Failed to open device {0}: {1}")]
    OpenFailed(u32, rusb::Error),
}

struct Entry {
    device_id: u32,
    device: Arc<Mutex<UsbDevice>>,
    owner: Option<SessionId>,
}

/// The server's device table
pub struct Inventory {
    context: Context,
    entries: Mutex<Vec<Entry>>,
    next_device_id: AtomicU32,
}

impl Inventory {
    /// Initialize the USB backend with an empty inventory
    pub fn new() -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
            entries: Mutex::new(Vec::new()),
            next_device_id: AtomicU32::new(1),
        })
    }

    /// Decide whether a device is publishable
    ///
    /// Hubs and Linux Foundation root-hub/virtual controllers are
    /// excluded; everything else is exported.
    pub fn should_export(device_class: u8, vendor_id: u16) -> bool {
        device_class != CLASS_HUB && vendor_id != VID_LINUX_FOUNDATION
    }

    /// Scan the bus, replacing the inventory contents
    ///
    /// Device ids keep increasing across scans so a stale id from an
    /// earlier scan can never alias a new device.
    pub fn scan(&self) -> Result<usize, rusb::Error> {
        let devices = self.context.devices()?;
        let mut fresh = Vec::new();

        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    warn!("Skipping device with unreadable descriptor: {}", e);
                    continue;
                }
            };
            if !Self::should_export(descriptor.class_code(), descriptor.vendor_id()) {
                debug!(
                    "Filtered out {:04x}:{:04x} (class {:#04x})",
                    descriptor.vendor_id(),
                    descriptor.product_id(),
                    descriptor.class_code()
                );
                continue;
            }

            let mut usb_device = match UsbDevice::new(device) {
                Ok(d) => d,
                Err(e) => {
                    warn!("Skipping device: {}", e);
                    continue;
                }
            };
            usb_device.read_strings();

            let device_id = self.next_device_id.fetch_add(1, Ordering::SeqCst);
            debug!(
                device_id,
                "Inventoried {:04x}:{:04x} busid {}-{}",
                usb_device.vendor_id(),
                usb_device.product_id(),
                usb_device.bus_number(),
                usb_device.port_number()
            );
            fresh.push(Entry {
                device_id,
                device: Arc::new(Mutex::new(usb_device)),
                owner: None,
            });
        }

        let count = fresh.len();
        *self.entries.lock().unwrap() = fresh;
        info!("Found {} USB devices", count);
        Ok(count)
    }

    /// Snapshot the inventory as wire records
    ///
    /// The table lock is released before touching the per-device
    /// locks, which the pump can hold for the length of a transfer.
    pub fn list(&self) -> Vec<DeviceRecord> {
        let snapshot: Vec<(u32, Arc<Mutex<UsbDevice>>)> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .map(|entry| (entry.device_id, Arc::clone(&entry.device)))
                .collect()
        };
        snapshot
            .into_iter()
            .map(|(device_id, device)| device.lock().unwrap().to_record(device_id))
            .collect()
    }

    /// Attach a device to a session, opening its backend handle
    ///
    /// Re-attaching a device the same session already owns succeeds.
    /// If the first open fails, one re-discovery pass replaces a stale
    /// backend device object with a fresh one before giving up.
    pub fn attach(
        &self,
        device_id: u32,
        session: SessionId,
    ) -> Result<Arc<Mutex<UsbDevice>>, AttachError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .iter_mut()
            .find(|e| e.device_id == device_id)
            .ok_or(AttachError::UnknownDevice(device_id))?;

        match entry.owner {
            Some(owner) if owner == session => return Ok(Arc::clone(&entry.device)),
            Some(_) => return Err(AttachError::AlreadyAttached(device_id)),
            None => {}
        }

        let open_result = entry.device.lock().unwrap().open();
        if let Err(first_error) = open_result {
            warn!(
                device_id,
                "Open failed ({}), attempting re-discovery", first_error
            );
            match self.rediscover(&entry.device) {
                Some(fresh) => entry.device = fresh,
                None => return Err(AttachError::OpenFailed(device_id, first_error)),
            }
        }

        entry.owner = Some(session);
        info!(device_id, session, "Device attached");
        Ok(Arc::clone(&entry.device))
    }

    /// Locate a fresh backend object matching a stale entry and open it
    ///
    /// Backend device objects can go stale between scan and attach;
    /// matching by (vid, pid, bus, address) recovers the same physical
    /// device.
    fn rediscover(&self, stale: &Arc<Mutex<UsbDevice>>) -> Option<Arc<Mutex<UsbDevice>>> {
        let (vid, pid, bus, address) = {
            let device = stale.lock().unwrap();
            (
                device.vendor_id(),
                device.product_id(),
                device.bus_number(),
                device.address(),
            )
        };

        let devices = self.context.devices().ok()?;
        for candidate in devices.iter() {
            let descriptor = match candidate.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != vid
                || descriptor.product_id() != pid
                || candidate.bus_number() != bus
                || candidate.address() != address
            {
                continue;
            }

            let mut fresh = UsbDevice::new(candidate).ok()?;
            if let Err(e) = fresh.open() {
                warn!("Re-discovered device still fails to open: {}", e);
                return None;
            }
            info!(
                "Re-discovered {:04x}:{:04x} on bus {} addr {}",
                vid, pid, bus, address
            );
            return Some(Arc::new(Mutex::new(fresh)));
        }
        None
    }

    /// Detach a device from a session
    ///
    /// Idempotent: detaching a device the session does not own is a
    /// no-op reported as success by the caller.
    pub fn detach(&self, device_id: u32, session: SessionId) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.device_id == device_id && e.owner == Some(session))
        {
            entry.device.lock().unwrap().close();
            entry.owner = None;
            info!(device_id, session, "Device detached");
        }
    }

    /// Release every device a session owns (disconnect path)
    pub fn release_session(&self, session: SessionId) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let mut released = 0;
        for entry in entries.iter_mut().filter(|e| e.owner == Some(session)) {
            entry.device.lock().unwrap().close();
            entry.owner = None;
            released += 1;
        }
        if released > 0 {
            info!(session, released, "Released session attachments");
        }
        released
    }
}
