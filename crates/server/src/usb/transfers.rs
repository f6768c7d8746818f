//! Synchronous USB transfer execution
//!
//! Transfers run on the URB pump thread against an open device handle
//! and report `(status, actual_length, data)` in URB completion terms:
//! status 0 on success, a negative errno on failure, and payload bytes
//! only for device-to-host transfers.

use protocol::{Direction, TransferKind, UrbHeader};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{trace, warn};

/// Timeout applied to every backend transfer
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

// Linux errno values reported in completion status
pub const EIO: i32 = 5;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;
pub const ENOSYS: i32 = 38;
pub const ECANCELED: i32 = 125;

/// Outcome of one transfer in completion terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// 0 on success, negative errno on failure
    pub status: i32,
    /// Bytes actually moved
    pub actual_length: u32,
    /// Data read from the device (IN transfers only)
    pub data: Vec<u8>,
}

impl TransferOutcome {
    pub fn failure(errno: i32) -> Self {
        Self {
            status: -errno,
            actual_length: 0,
            data: Vec::new(),
        }
    }

    fn read(data: Vec<u8>) -> Self {
        Self {
            status: 0,
            actual_length: data.len() as u32,
            data,
        }
    }

    fn wrote(len: usize) -> Self {
        Self {
            status: 0,
            actual_length: len as u32,
            data: Vec::new(),
        }
    }
}

/// Execute a URB against an open device handle
pub fn execute(handle: &DeviceHandle<Context>, header: &UrbHeader, data: &[u8]) -> TransferOutcome {
    trace!(
        "Executing {:?} {:?} transfer: urb_id={}, endpoint={:#04x}, length={}",
        header.kind, header.direction, header.urb_id, header.endpoint, header.transfer_length
    );

    match header.kind {
        TransferKind::Bulk => match header.direction {
            Direction::Out => match handle.write_bulk(header.endpoint, data, TRANSFER_TIMEOUT) {
                Ok(len) => TransferOutcome::wrote(len),
                Err(e) => transfer_failed("bulk OUT", header.endpoint, e),
            },
            Direction::In => {
                let mut buffer = vec![0u8; header.transfer_length as usize];
                match handle.read_bulk(header.endpoint, &mut buffer, TRANSFER_TIMEOUT) {
                    Ok(len) => {
                        buffer.truncate(len);
                        TransferOutcome::read(buffer)
                    }
                    Err(e) => transfer_failed("bulk IN", header.endpoint, e),
                }
            }
        },
        TransferKind::Interrupt => match header.direction {
            Direction::Out => {
                match handle.write_interrupt(header.endpoint, data, TRANSFER_TIMEOUT) {
                    Ok(len) => TransferOutcome::wrote(len),
                    Err(e) => transfer_failed("interrupt OUT", header.endpoint, e),
                }
            }
            Direction::In => {
                let mut buffer = vec![0u8; header.transfer_length as usize];
                match handle.read_interrupt(header.endpoint, &mut buffer, TRANSFER_TIMEOUT) {
                    Ok(len) => {
                        buffer.truncate(len);
                        TransferOutcome::read(buffer)
                    }
                    Err(e) => transfer_failed("interrupt IN", header.endpoint, e),
                }
            }
        },
        TransferKind::Control => execute_control(handle, header, data),
        TransferKind::Iso => {
            // The sync backend API has no isochronous path.
            warn!(urb_id = header.urb_id, "Isochronous transfer not supported");
            TransferOutcome::failure(ENOSYS)
        }
    }
}

/// Control transfer: the first 8 payload bytes are the setup packet
/// (bmRequestType, bRequest, wValue, wIndex, wLength little-endian);
/// the actual data direction comes from bmRequestType bit 7.
fn execute_control(
    handle: &DeviceHandle<Context>,
    header: &UrbHeader,
    data: &[u8],
) -> TransferOutcome {
    if data.len() < 8 {
        warn!(
            urb_id = header.urb_id,
            "Control URB without setup packet ({} bytes)",
            data.len()
        );
        return TransferOutcome::failure(EINVAL);
    }

    let request_type = data[0];
    let request = data[1];
    let value = u16::from_le_bytes([data[2], data[3]]);
    let index = u16::from_le_bytes([data[4], data[5]]);
    let length = u16::from_le_bytes([data[6], data[7]]);

    if request_type & 0x80 != 0 {
        let mut buffer = vec![0u8; length as usize];
        match handle.read_control(request_type, request, value, index, &mut buffer, TRANSFER_TIMEOUT)
        {
            Ok(len) => {
                buffer.truncate(len);
                TransferOutcome::read(buffer)
            }
            Err(e) => transfer_failed("control IN", 0, e),
        }
    } else {
        match handle.write_control(
            request_type,
            request,
            value,
            index,
            &data[8..],
            TRANSFER_TIMEOUT,
        ) {
            Ok(len) => TransferOutcome::wrote(len),
            Err(e) => transfer_failed("control OUT", 0, e),
        }
    }
}

fn transfer_failed(what: &str, endpoint: u8, error: rusb::Error) -> TransferOutcome {
    warn!(
        "{} transfer on endpoint {:#04x} failed: {}",
        what, endpoint, error
    );
    TransferOutcome::failure(errno_from(error))
}

/// Map a backend error to the errno reported in completion status
pub fn errno_from(error: rusb::Error) -> i32 {
    match error {
        rusb::Error::Timeout => 110,     // ETIMEDOUT
        rusb::Error::Pipe => 32,         // EPIPE
        rusb::Error::NoDevice => ENODEV, // ENODEV
        rusb::Error::NotFound => 2,      // ENOENT
        rusb::Error::Busy => 16,         // EBUSY
        rusb::Error::Overflow => 75,     // EOVERFLOW
        rusb::Error::InvalidParam => EINVAL,
        rusb::Error::Access => 13, // EACCES
        rusb::Error::NotSupported => ENOSYS,
        _ => EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(errno_from(rusb::Error::Timeout), 110);
        assert_eq!(errno_from(rusb::Error::Pipe), 32);
        assert_eq!(errno_from(rusb::Error::NoDevice), 19);
        assert_eq!(errno_from(rusb::Error::Access), 13);
        assert_eq!(errno_from(rusb::Error::Io), 5);
    }

    #[test]
    fn test_failure_outcome_negates_errno() {
        let outcome = TransferOutcome::failure(ENODEV);
        assert_eq!(outcome.status, -19);
        assert_eq!(outcome.actual_length, 0);
        assert!(outcome.data.is_empty());
    }
}
