//! On-wire structure definitions
//!
//! Every struct here has a fixed little-endian wire layout read and
//! written field by field. Host struct layout is never reinterpreted;
//! the `SIZE` constants are part of the external contract.

use crate::error::{ProtocolError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// USB transfer kind carried in a [`UrbHeader`]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Isochronous transfer (audio/video streaming)
    Iso = 0,
    /// Interrupt transfer (HID and other low-latency devices)
    Interrupt = 1,
    /// Control transfer (endpoint 0)
    Control = 2,
    /// Bulk transfer (storage, network adapters)
    Bulk = 3,
}

impl TryFrom<u8> for TransferKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Iso),
            1 => Ok(Self::Interrupt),
            2 => Ok(Self::Control),
            3 => Ok(Self::Bulk),
            _ => Err(ProtocolError::InvalidValue {
                field: "transfer kind",
                value: value as u32,
            }),
        }
    }
}

/// Transfer direction relative to the host
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to device
    Out = 0,
    /// Device to host
    In = 1,
}

impl TryFrom<u8> for Direction {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Out),
            1 => Ok(Self::In),
            _ => Err(ProtocolError::InvalidValue {
                field: "direction",
                value: value as u32,
            }),
        }
    }
}

/// Device descriptor snapshot published in inventory responses
///
/// Wire layout is 200 bytes, little-endian, no padding. The string
/// fields occupy fixed widths and are NUL-padded; readers bound by the
/// field width and must not rely on a terminator being present.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceRecord {
    pub bus_id: u32,
    pub device_id: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_class: u16,
    pub device_subclass: u16,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_interfaces: u8,
    pub device_speed: u8,
    pub bus_num: u8,
    pub device_num: u8,
    pub port_number: u8,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
    pub busid: String,
}

impl DeviceRecord {
    /// Size of the record on the wire in bytes
    pub const SIZE: usize = 200;

    /// Width of the manufacturer/product string fields
    pub const STRING_WIDTH: usize = 64;
    /// Width of the serial string field
    pub const SERIAL_WIDTH: usize = 32;
    /// Width of the busid field
    pub const BUSID_WIDTH: usize = 16;

    /// Format the short location identifier, e.g. `"2-2"`
    pub fn format_busid(bus_num: u8, port_number: u8) -> String {
        format!("{}-{}", bus_num, port_number)
    }

    /// Read a record from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let bus_id = reader.read_u32::<LittleEndian>()?;
        let device_id = reader.read_u32::<LittleEndian>()?;
        let vendor_id = reader.read_u16::<LittleEndian>()?;
        let product_id = reader.read_u16::<LittleEndian>()?;
        let device_class = reader.read_u16::<LittleEndian>()?;
        let device_subclass = reader.read_u16::<LittleEndian>()?;
        let device_protocol = reader.read_u8()?;
        let configuration_value = reader.read_u8()?;
        let num_interfaces = reader.read_u8()?;
        let device_speed = reader.read_u8()?;
        let bus_num = reader.read_u8()?;
        let device_num = reader.read_u8()?;
        let port_number = reader.read_u8()?;
        let _reserved = reader.read_u8()?;
        let manufacturer = read_padded_str(reader, Self::STRING_WIDTH)?;
        let product = read_padded_str(reader, Self::STRING_WIDTH)?;
        let serial = read_padded_str(reader, Self::SERIAL_WIDTH)?;
        let busid = read_padded_str(reader, Self::BUSID_WIDTH)?;

        Ok(Self {
            bus_id,
            device_id,
            vendor_id,
            product_id,
            device_class,
            device_subclass,
            device_protocol,
            configuration_value,
            num_interfaces,
            device_speed,
            bus_num,
            device_num,
            port_number,
            manufacturer,
            product,
            serial,
            busid,
        })
    }

    /// Write the record to a writer
    ///
    /// Over-long strings are truncated to their field width.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.bus_id)?;
        writer.write_u32::<LittleEndian>(self.device_id)?;
        writer.write_u16::<LittleEndian>(self.vendor_id)?;
        writer.write_u16::<LittleEndian>(self.product_id)?;
        writer.write_u16::<LittleEndian>(self.device_class)?;
        writer.write_u16::<LittleEndian>(self.device_subclass)?;
        writer.write_u8(self.device_protocol)?;
        writer.write_u8(self.configuration_value)?;
        writer.write_u8(self.num_interfaces)?;
        writer.write_u8(self.device_speed)?;
        writer.write_u8(self.bus_num)?;
        writer.write_u8(self.device_num)?;
        writer.write_u8(self.port_number)?;
        writer.write_u8(0)?; // reserved
        write_padded_str(writer, &self.manufacturer, Self::STRING_WIDTH)?;
        write_padded_str(writer, &self.product, Self::STRING_WIDTH)?;
        write_padded_str(writer, &self.serial, Self::SERIAL_WIDTH)?;
        write_padded_str(writer, &self.busid, Self::BUSID_WIDTH)?;
        Ok(())
    }
}

/// USB Request Block header
///
/// Shared by submissions and completions; 32 bytes on the wire. A
/// completion echoes `urb_id` and `device_id` verbatim, sets `status`
/// and overwrites `transfer_length` with the actual byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrbHeader {
    /// Client-assigned URB identifier, unique per connection
    pub urb_id: u64,
    /// Target device
    pub device_id: u32,
    /// Transfer kind
    pub kind: TransferKind,
    /// Transfer direction
    pub direction: Direction,
    /// Endpoint address
    pub endpoint: u8,
    /// URB flags (reserved)
    pub flags: u8,
    /// Expected (submission) or actual (completion) transfer length
    pub transfer_length: u32,
    /// Start frame for isochronous transfers
    pub start_frame: u32,
    /// Packet count for isochronous transfers
    pub number_of_packets: u32,
    /// Transfer status: 0 = success, negative = backend errno
    pub status: i32,
}

impl UrbHeader {
    /// Size of the header on the wire in bytes
    pub const SIZE: usize = 32;

    /// Build a submission header with zeroed iso fields and status
    pub fn submission(
        urb_id: u64,
        device_id: u32,
        kind: TransferKind,
        direction: Direction,
        endpoint: u8,
        transfer_length: u32,
    ) -> Self {
        Self {
            urb_id,
            device_id,
            kind,
            direction,
            endpoint,
            flags: 0,
            transfer_length,
            start_frame: 0,
            number_of_packets: 0,
            status: 0,
        }
    }

    /// Read a header from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let urb_id = reader.read_u64::<LittleEndian>()?;
        let device_id = reader.read_u32::<LittleEndian>()?;
        let kind = TransferKind::try_from(reader.read_u8()?)?;
        let direction = Direction::try_from(reader.read_u8()?)?;
        let endpoint = reader.read_u8()?;
        let flags = reader.read_u8()?;
        let transfer_length = reader.read_u32::<LittleEndian>()?;
        let start_frame = reader.read_u32::<LittleEndian>()?;
        let number_of_packets = reader.read_u32::<LittleEndian>()?;
        let status = reader.read_i32::<LittleEndian>()?;

        Ok(Self {
            urb_id,
            device_id,
            kind,
            direction,
            endpoint,
            flags,
            transfer_length,
            start_frame,
            number_of_packets,
            status,
        })
    }

    /// Write the header to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<LittleEndian>(self.urb_id)?;
        writer.write_u32::<LittleEndian>(self.device_id)?;
        writer.write_u8(self.kind as u8)?;
        writer.write_u8(self.direction as u8)?;
        writer.write_u8(self.endpoint)?;
        writer.write_u8(self.flags)?;
        writer.write_u32::<LittleEndian>(self.transfer_length)?;
        writer.write_u32::<LittleEndian>(self.start_frame)?;
        writer.write_u32::<LittleEndian>(self.number_of_packets)?;
        writer.write_i32::<LittleEndian>(self.status)?;
        Ok(())
    }
}

/// Bulk data stream chunk header, 24 bytes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkDataHeader {
    /// Stream identifier
    pub stream_id: u64,
    /// Total uncompressed stream size
    pub total_size: u32,
    /// Uncompressed size of this chunk
    pub chunk_size: u32,
    /// Offset of this chunk in the stream
    pub chunk_offset: u32,
    /// Compression algorithm tag for the chunk bytes
    pub compression: u8,
}

impl BulkDataHeader {
    /// Size of the header on the wire in bytes
    pub const SIZE: usize = 24;

    /// Read a header from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let stream_id = reader.read_u64::<LittleEndian>()?;
        let total_size = reader.read_u32::<LittleEndian>()?;
        let chunk_size = reader.read_u32::<LittleEndian>()?;
        let chunk_offset = reader.read_u32::<LittleEndian>()?;
        let compression = reader.read_u8()?;
        let mut reserved = [0u8; 3];
        reader.read_exact(&mut reserved)?;

        Ok(Self {
            stream_id,
            total_size,
            chunk_size,
            chunk_offset,
            compression,
        })
    }

    /// Write the header to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<LittleEndian>(self.stream_id)?;
        writer.write_u32::<LittleEndian>(self.total_size)?;
        writer.write_u32::<LittleEndian>(self.chunk_size)?;
        writer.write_u32::<LittleEndian>(self.chunk_offset)?;
        writer.write_u8(self.compression)?;
        writer.write_all(&[0u8; 3])?;
        Ok(())
    }
}

/// Read a fixed-width NUL-padded string field
///
/// Always consumes exactly `width` bytes. The string ends at the first
/// NUL or at the field boundary, whichever comes first; invalid UTF-8
/// is replaced rather than rejected.
pub(crate) fn read_padded_str<R: Read>(reader: &mut R, width: usize) -> Result<String> {
    let mut buf = vec![0u8; width];
    reader.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(width);
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Write a string into a fixed-width NUL-padded field, truncating at
/// the field width
pub(crate) fn write_padded_str<W: Write>(writer: &mut W, s: &str, width: usize) -> Result<()> {
    let bytes = s.as_bytes();
    let take = bytes.len().min(width);
    writer.write_all(&bytes[..take])?;
    if take < width {
        writer.write_all(&vec![0u8; width - take])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_record() -> DeviceRecord {
        DeviceRecord {
            bus_id: 2,
            device_id: 1,
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_class: 0x08,
            device_subclass: 0x06,
            device_protocol: 0x50,
            configuration_value: 1,
            num_interfaces: 1,
            device_speed: 3,
            bus_num: 2,
            device_num: 4,
            port_number: 2,
            manufacturer: "Test Manufacturer".to_string(),
            product: "Test Product".to_string(),
            serial: "SN0001".to_string(),
            busid: "2-2".to_string(),
        }
    }

    #[test]
    fn test_device_record_size() {
        let mut buf = Vec::new();
        sample_record().write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), DeviceRecord::SIZE);
    }

    #[test]
    fn test_device_record_roundtrip() {
        let record = sample_record();
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();

        let decoded = DeviceRecord::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_string_fields_are_nul_padded() {
        let record = sample_record();
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();

        // Manufacturer field starts at offset 24; bytes past the string
        // must be zero all the way to the field boundary.
        let field = &buf[24..24 + DeviceRecord::STRING_WIDTH];
        assert_eq!(&field[..17], b"Test Manufacturer");
        assert!(field[17..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unterminated_string_is_bounded_by_field_width() {
        let record = sample_record();
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();

        // Fill the busid field completely, with no NUL terminator.
        let busid_off = DeviceRecord::SIZE - DeviceRecord::BUSID_WIDTH;
        for b in &mut buf[busid_off..] {
            *b = b'x';
        }

        let decoded = DeviceRecord::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded.busid.len(), DeviceRecord::BUSID_WIDTH);
        assert!(decoded.busid.bytes().all(|b| b == b'x'));
    }

    #[test]
    fn test_overlong_string_truncated() {
        let mut record = sample_record();
        record.serial = "S".repeat(100);

        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), DeviceRecord::SIZE);

        let decoded = DeviceRecord::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded.serial.len(), DeviceRecord::SERIAL_WIDTH);
    }

    #[test]
    fn test_urb_header_roundtrip() {
        let header = UrbHeader {
            urb_id: 17,
            device_id: 1,
            kind: TransferKind::Bulk,
            direction: Direction::Out,
            endpoint: 0x02,
            flags: 0,
            transfer_length: 512,
            start_frame: 0,
            number_of_packets: 0,
            status: 0,
        };

        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), UrbHeader::SIZE);

        let decoded = UrbHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_urb_header_negative_status() {
        let mut header = UrbHeader::submission(9, 3, TransferKind::Interrupt, Direction::In, 0x81, 8);
        header.status = -110;

        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let decoded = UrbHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded.status, -110);
    }

    #[test]
    fn test_urb_header_rejects_unknown_kind() {
        let header = UrbHeader::submission(1, 1, TransferKind::Bulk, Direction::Out, 0x02, 0);
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        buf[12] = 7; // transfer kind byte

        let result = UrbHeader::read_from(&mut Cursor::new(buf));
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidValue { field: "transfer kind", .. })
        ));
    }

    #[test]
    fn test_bulk_header_roundtrip() {
        let header = BulkDataHeader {
            stream_id: 0xdead_beef,
            total_size: 1 << 20,
            chunk_size: 65536,
            chunk_offset: 131072,
            compression: 1,
        };

        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), BulkDataHeader::SIZE);

        let decoded = BulkDataHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_format_busid() {
        assert_eq!(DeviceRecord::format_busid(2, 2), "2-2");
        assert_eq!(DeviceRecord::format_busid(3, 1), "3-1");
    }

    #[test]
    fn test_transfer_kind_conversion() {
        assert_eq!(TransferKind::try_from(0).unwrap(), TransferKind::Iso);
        assert_eq!(TransferKind::try_from(3).unwrap(), TransferKind::Bulk);
        assert!(TransferKind::try_from(4).is_err());

        assert_eq!(Direction::try_from(1).unwrap(), Direction::In);
        assert!(Direction::try_from(2).is_err());
    }
}
