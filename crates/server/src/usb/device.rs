//! USB device abstraction
//!
//! Wraps a `rusb::Device` with its cached descriptor and optional open
//! handle, and converts to the on-wire [`DeviceRecord`].

use protocol::DeviceRecord;
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use tracing::{debug, warn};

/// Cached string descriptors, read while the device can be opened
#[derive(Debug, Clone, Default)]
struct DeviceStrings {
    manufacturer: String,
    product: String,
    serial: String,
}

/// A host USB device published in the inventory
///
/// The handle is `None` while the device sits in the inventory and is
/// populated on attach. At most one client session owns an open handle
/// at a time; the inventory enforces that.
pub struct UsbDevice {
    device: Device<Context>,
    descriptor: DeviceDescriptor,
    handle: Option<DeviceHandle<Context>>,
    strings: DeviceStrings,
    num_interfaces: u8,
}

impl UsbDevice {
    /// Wrap a device, caching its descriptor
    pub fn new(device: Device<Context>) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        Ok(Self {
            device,
            descriptor,
            handle: None,
            strings: DeviceStrings::default(),
            num_interfaces: 0,
        })
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn address(&self) -> u8 {
        self.device.address()
    }

    /// Port on the parent hub; devices without port information report
    /// their bus address instead, so the busid stays unique.
    pub fn port_number(&self) -> u8 {
        match self.device.port_number() {
            0 => self.address(),
            port => port,
        }
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id()
    }

    /// The open handle, if attached
    pub fn handle(&self) -> Option<&DeviceHandle<Context>> {
        self.handle.as_ref()
    }

    /// Read string descriptors without keeping the device open
    ///
    /// Called during scan so list responses carry strings even for
    /// unattached devices. Failure leaves the fields empty.
    pub fn read_strings(&mut self) {
        let handle = match self.device.open() {
            Ok(handle) => handle,
            Err(e) => {
                debug!(
                    "Cannot open {:04x}:{:04x} for string descriptors: {}",
                    self.vendor_id(),
                    self.product_id(),
                    e
                );
                return;
            }
        };
        self.strings = read_string_descriptors(&handle, &self.descriptor);
    }

    /// Open the device for transfers
    ///
    /// Idempotent: opening an already-open device succeeds. Also
    /// refreshes string descriptors and the interface count.
    pub fn open(&mut self) -> Result<(), rusb::Error> {
        if self.handle.is_some() {
            return Ok(());
        }

        let handle = self.device.open()?;
        self.strings = read_string_descriptors(&handle, &self.descriptor);

        self.num_interfaces = match self.device.active_config_descriptor() {
            Ok(config) => config.num_interfaces(),
            Err(e) => {
                debug!("No active config descriptor ({}), assuming 1 interface", e);
                1
            }
        };

        debug!(
            "Opened device {:04x}:{:04x} on bus {} ({} interfaces)",
            self.vendor_id(),
            self.product_id(),
            self.bus_number(),
            self.num_interfaces
        );
        self.handle = Some(handle);
        Ok(())
    }

    /// Close the device, dropping the handle
    ///
    /// In-flight transfers on the handle fail once it is gone; queued
    /// submissions observe the closed state and complete with an error.
    pub fn close(&mut self) {
        if self.handle.take().is_some() {
            debug!(
                "Closed device {:04x}:{:04x} on bus {}",
                self.vendor_id(),
                self.product_id(),
                self.bus_number()
            );
        }
    }

    /// Build the wire descriptor for this device
    pub fn to_record(&self, device_id: u32) -> DeviceRecord {
        let bus_num = self.bus_number();
        let port_number = self.port_number();
        DeviceRecord {
            bus_id: bus_num as u32,
            device_id,
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            device_class: self.descriptor.class_code() as u16,
            device_subclass: self.descriptor.sub_class_code() as u16,
            device_protocol: self.descriptor.protocol_code(),
            configuration_value: u8::from(self.descriptor.num_configurations() > 0),
            num_interfaces: self.num_interfaces,
            device_speed: speed_code(self.device.speed()),
            bus_num,
            device_num: self.address(),
            port_number,
            manufacturer: self.strings.manufacturer.clone(),
            product: self.strings.product.clone(),
            serial: self.strings.serial.clone(),
            busid: DeviceRecord::format_busid(bus_num, port_number),
        }
    }
}

fn read_string_descriptors(
    handle: &DeviceHandle<Context>,
    descriptor: &DeviceDescriptor,
) -> DeviceStrings {
    let read = |index: Option<u8>| {
        index
            .and_then(|i| {
                handle
                    .read_string_descriptor_ascii(i)
                    .map_err(|e| {
                        warn!("Failed to read string descriptor {}: {}", i, e);
                        e
                    })
                    .ok()
            })
            .unwrap_or_default()
    };

    DeviceStrings {
        manufacturer: read(descriptor.manufacturer_string_index()),
        product: read(descriptor.product_string_index()),
        serial: read(descriptor.serial_number_string_index()),
    }
}

/// Map rusb speed to the numeric wire code (libusb values)
fn speed_code(speed: rusb::Speed) -> u8 {
    match speed {
        rusb::Speed::Low => 1,
        rusb::Speed::Full => 2,
        rusb::Speed::High => 3,
        rusb::Speed::Super => 4,
        rusb::Speed::SuperPlus => 5,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_codes() {
        assert_eq!(speed_code(rusb::Speed::Low), 1);
        assert_eq!(speed_code(rusb::Speed::Full), 2);
        assert_eq!(speed_code(rusb::Speed::High), 3);
        assert_eq!(speed_code(rusb::Speed::Super), 4);
        assert_eq!(speed_code(rusb::Speed::SuperPlus), 5);
        assert_eq!(speed_code(rusb::Speed::Unknown), 0);
    }
}
