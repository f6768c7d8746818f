//! Protocol message definitions
//!
//! Every message is a tagged variant; dispatch on an incoming frame is
//! a single match on [`Message`]. The type byte values and payload
//! grammars are fixed externally and must not change.

use crate::error::{ProtocolError, Result};
use crate::types::{BulkDataHeader, DeviceRecord, UrbHeader};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Wire message type byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    DeviceListRequest = 0x01,
    DeviceListResponse = 0x02,
    DeviceAttachRequest = 0x03,
    DeviceAttachResponse = 0x04,
    DeviceDetachRequest = 0x05,
    DeviceDetachResponse = 0x06,
    UsbSubmitUrb = 0x10,
    UsbCompleteUrb = 0x11,
    UsbUnlinkUrb = 0x12,
    BulkDataStart = 0x20,
    BulkDataChunk = 0x21,
    BulkDataEnd = 0x22,
    Error = 0xFF,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::DeviceListRequest),
            0x02 => Ok(Self::DeviceListResponse),
            0x03 => Ok(Self::DeviceAttachRequest),
            0x04 => Ok(Self::DeviceAttachResponse),
            0x05 => Ok(Self::DeviceDetachRequest),
            0x06 => Ok(Self::DeviceDetachResponse),
            0x10 => Ok(Self::UsbSubmitUrb),
            0x11 => Ok(Self::UsbCompleteUrb),
            0x12 => Ok(Self::UsbUnlinkUrb),
            0x20 => Ok(Self::BulkDataStart),
            0x21 => Ok(Self::BulkDataChunk),
            0x22 => Ok(Self::BulkDataEnd),
            0xFF => Ok(Self::Error),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// A decoded protocol message
///
/// Request/response correlation runs through the envelope `sequence`
/// field, not through the message body; `urb_id` independently
/// correlates USB submissions with completions.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Ask the server for its current inventory
    DeviceListRequest,
    /// Inventory snapshot: concatenated device records
    DeviceListResponse { devices: Vec<DeviceRecord> },
    /// Ask to attach a device by id
    DeviceAttachRequest { device_id: u32 },
    /// Attach outcome
    DeviceAttachResponse { success: bool },
    /// Ask to detach a device by id
    DeviceDetachRequest { device_id: u32 },
    /// Detach outcome (always success for unknown ids)
    DeviceDetachResponse { success: bool },
    /// Submit a URB; `data` is non-empty only for OUT transfers
    SubmitUrb { header: UrbHeader, data: Vec<u8> },
    /// URB completion; `data` is non-empty only for IN transfers
    CompleteUrb { header: UrbHeader, data: Vec<u8> },
    /// Cancel a pending URB identified by `header.urb_id`
    UnlinkUrb { header: UrbHeader },
    /// Open a bulk data stream
    BulkDataStart { header: BulkDataHeader, data: Vec<u8> },
    /// Middle chunk of a bulk data stream
    BulkDataChunk { header: BulkDataHeader, data: Vec<u8> },
    /// Final chunk of a bulk data stream
    BulkDataEnd { header: BulkDataHeader, data: Vec<u8> },
    /// Human-readable diagnostic from the peer
    Error { message: String },
}

impl Message {
    /// The wire type byte for this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::DeviceListRequest => MessageKind::DeviceListRequest,
            Message::DeviceListResponse { .. } => MessageKind::DeviceListResponse,
            Message::DeviceAttachRequest { .. } => MessageKind::DeviceAttachRequest,
            Message::DeviceAttachResponse { .. } => MessageKind::DeviceAttachResponse,
            Message::DeviceDetachRequest { .. } => MessageKind::DeviceDetachRequest,
            Message::DeviceDetachResponse { .. } => MessageKind::DeviceDetachResponse,
            Message::SubmitUrb { .. } => MessageKind::UsbSubmitUrb,
            Message::CompleteUrb { .. } => MessageKind::UsbCompleteUrb,
            Message::UnlinkUrb { .. } => MessageKind::UsbUnlinkUrb,
            Message::BulkDataStart { .. } => MessageKind::BulkDataStart,
            Message::BulkDataChunk { .. } => MessageKind::BulkDataChunk,
            Message::BulkDataEnd { .. } => MessageKind::BulkDataEnd,
            Message::Error { .. } => MessageKind::Error,
        }
    }

    /// Serialize the message payload (everything after the frame header)
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Message::DeviceListRequest => {}
            Message::DeviceListResponse { devices } => {
                for device in devices {
                    device.write_to(&mut buf)?;
                }
            }
            Message::DeviceAttachRequest { device_id }
            | Message::DeviceDetachRequest { device_id } => {
                buf.write_u32::<LittleEndian>(*device_id)?;
            }
            Message::DeviceAttachResponse { success }
            | Message::DeviceDetachResponse { success } => {
                buf.write_u32::<LittleEndian>(u32::from(*success))?;
            }
            Message::SubmitUrb { header, data } | Message::CompleteUrb { header, data } => {
                header.write_to(&mut buf)?;
                buf.extend_from_slice(data);
            }
            Message::UnlinkUrb { header } => {
                header.write_to(&mut buf)?;
            }
            Message::BulkDataStart { header, data }
            | Message::BulkDataChunk { header, data }
            | Message::BulkDataEnd { header, data } => {
                header.write_to(&mut buf)?;
                buf.extend_from_slice(data);
            }
            Message::Error { message } => {
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
            }
        }
        Ok(buf)
    }

    /// Parse a payload for the given message kind
    pub fn parse(kind: MessageKind, payload: &[u8]) -> Result<Self> {
        match kind {
            MessageKind::DeviceListRequest => Ok(Message::DeviceListRequest),
            MessageKind::DeviceListResponse => {
                if payload.len() % DeviceRecord::SIZE != 0 {
                    return Err(ProtocolError::PayloadTooSmall {
                        needed: payload.len().div_ceil(DeviceRecord::SIZE) * DeviceRecord::SIZE,
                        available: payload.len(),
                    });
                }
                let mut cursor = Cursor::new(payload);
                let mut devices = Vec::with_capacity(payload.len() / DeviceRecord::SIZE);
                for _ in 0..payload.len() / DeviceRecord::SIZE {
                    devices.push(DeviceRecord::read_from(&mut cursor)?);
                }
                Ok(Message::DeviceListResponse { devices })
            }
            MessageKind::DeviceAttachRequest => Ok(Message::DeviceAttachRequest {
                device_id: parse_u32(payload)?,
            }),
            MessageKind::DeviceAttachResponse => Ok(Message::DeviceAttachResponse {
                success: parse_u32(payload)? != 0,
            }),
            MessageKind::DeviceDetachRequest => Ok(Message::DeviceDetachRequest {
                device_id: parse_u32(payload)?,
            }),
            MessageKind::DeviceDetachResponse => Ok(Message::DeviceDetachResponse {
                success: parse_u32(payload)? != 0,
            }),
            MessageKind::UsbSubmitUrb => {
                let (header, data) = parse_urb(payload)?;
                Ok(Message::SubmitUrb { header, data })
            }
            MessageKind::UsbCompleteUrb => {
                let (header, data) = parse_urb(payload)?;
                Ok(Message::CompleteUrb { header, data })
            }
            MessageKind::UsbUnlinkUrb => {
                let (header, _) = parse_urb(payload)?;
                Ok(Message::UnlinkUrb { header })
            }
            MessageKind::BulkDataStart => {
                let (header, data) = parse_bulk(payload)?;
                Ok(Message::BulkDataStart { header, data })
            }
            MessageKind::BulkDataChunk => {
                let (header, data) = parse_bulk(payload)?;
                Ok(Message::BulkDataChunk { header, data })
            }
            MessageKind::BulkDataEnd => {
                let (header, data) = parse_bulk(payload)?;
                Ok(Message::BulkDataEnd { header, data })
            }
            MessageKind::Error => {
                // NUL-terminated on the wire; tolerate a missing
                // terminator from older peers.
                let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                Ok(Message::Error {
                    message: String::from_utf8_lossy(&payload[..end]).into_owned(),
                })
            }
        }
    }
}

fn parse_u32(payload: &[u8]) -> Result<u32> {
    if payload.len() < 4 {
        return Err(ProtocolError::PayloadTooSmall {
            needed: 4,
            available: payload.len(),
        });
    }
    Cursor::new(payload).read_u32::<LittleEndian>().map_err(Into::into)
}

fn parse_urb(payload: &[u8]) -> Result<(UrbHeader, Vec<u8>)> {
    if payload.len() < UrbHeader::SIZE {
        return Err(ProtocolError::PayloadTooSmall {
            needed: UrbHeader::SIZE,
            available: payload.len(),
        });
    }
    let mut cursor = Cursor::new(payload);
    let header = UrbHeader::read_from(&mut cursor)?;
    Ok((header, payload[UrbHeader::SIZE..].to_vec()))
}

fn parse_bulk(payload: &[u8]) -> Result<(BulkDataHeader, Vec<u8>)> {
    if payload.len() < BulkDataHeader::SIZE {
        return Err(ProtocolError::PayloadTooSmall {
            needed: BulkDataHeader::SIZE,
            available: payload.len(),
        });
    }
    let mut cursor = Cursor::new(payload);
    let header = BulkDataHeader::read_from(&mut cursor)?;
    Ok((header, payload[BulkDataHeader::SIZE..].to_vec()))
}
