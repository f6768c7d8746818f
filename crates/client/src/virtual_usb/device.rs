//! Virtual device state
//!
//! A [`VirtualDevice`] exists for each successfully attached remote
//! device. The local sink submits URBs through it and pulls
//! completions out of its queue; the background reader pushes
//! completions in as they arrive from the server.

use crate::network::SessionShared;
use common::Error;
use protocol::{DeviceRecord, Direction, Message, TransferKind, UrbHeader};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// A completed URB as delivered to the local sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Header with `status` set and `transfer_length` overwritten with
    /// the actual byte count
    pub header: UrbHeader,
    /// Bytes read from the device (IN transfers only)
    pub data: Vec<u8>,
}

#[derive(Default)]
struct DeviceState {
    /// Outstanding submissions keyed by urb id
    pending: HashMap<u64, UrbHeader>,
    /// Completions awaiting the sink
    completions: VecDeque<Completion>,
}

/// Client-side stand-in for an attached remote device
pub struct VirtualDevice {
    descriptor: DeviceRecord,
    session: Arc<SessionShared>,
    state: Mutex<DeviceState>,
    completion_ready: Condvar,
}

impl VirtualDevice {
    pub(crate) fn new(descriptor: DeviceRecord, session: Arc<SessionShared>) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            session,
            state: Mutex::new(DeviceState::default()),
            completion_ready: Condvar::new(),
        })
    }

    /// The descriptor received at attach time
    pub fn descriptor(&self) -> &DeviceRecord {
        &self.descriptor
    }

    pub fn device_id(&self) -> u32 {
        self.descriptor.device_id
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Submit a URB to the remote device
    ///
    /// Assigns the next URB id, sends the frame and returns
    /// immediately; the result arrives later through
    /// [`next_completion`](Self::next_completion). For OUT transfers
    /// the wire length is the payload length; `transfer_length` sizes
    /// the read for IN transfers.
    pub fn submit(
        &self,
        kind: TransferKind,
        direction: Direction,
        endpoint: u8,
        transfer_length: u32,
        data: Vec<u8>,
    ) -> common::Result<u64> {
        if !self.session.is_connected() {
            return Err(Error::Network("Not connected".to_string()));
        }

        let length = match direction {
            Direction::Out => data.len() as u32,
            Direction::In => transfer_length,
        };
        let urb_id = self.session.next_urb_id();
        let header = UrbHeader::submission(
            urb_id,
            self.descriptor.device_id,
            kind,
            direction,
            endpoint,
            length,
        );

        // Record before sending: a completion can race the send
        // returning.
        self.state.lock().unwrap().pending.insert(urb_id, header);

        let payload = match direction {
            Direction::Out => data,
            Direction::In => Vec::new(),
        };
        if let Err(e) = self.session.send(Message::SubmitUrb {
            header,
            data: payload,
        }) {
            self.state.lock().unwrap().pending.remove(&urb_id);
            return Err(e);
        }

        debug!(urb_id, endpoint, ?kind, ?direction, "URB submitted");
        Ok(urb_id)
    }

    /// Ask the server to cancel an outstanding URB
    ///
    /// The eventual completion carrying a cancelled status is the
    /// authoritative signal; an unlink for an already-completed URB is
    /// ignored by the server.
    pub fn unlink(&self, urb_id: u64) -> common::Result<()> {
        let header = match self.state.lock().unwrap().pending.get(&urb_id) {
            Some(header) => *header,
            None => return Ok(()),
        };
        self.session.send(Message::UnlinkUrb { header })?;
        Ok(())
    }

    /// Wait up to `timeout` for the next completion
    pub fn next_completion(&self, timeout: Duration) -> Option<Completion> {
        let state = self.state.lock().unwrap();
        let (mut state, _) = self
            .completion_ready
            .wait_timeout_while(state, timeout, |s| s.completions.is_empty())
            .ok()?;
        state.completions.pop_front()
    }

    /// Number of URBs awaiting completion
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Deliver a completion from the background reader
    pub(crate) fn complete(&self, header: UrbHeader, data: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if state.pending.remove(&header.urb_id).is_none() {
            // At most one completion per submission; drop strays.
            warn!(
                urb_id = header.urb_id,
                "Completion for unknown URB dropped"
            );
            return;
        }
        state.completions.push_back(Completion { header, data });
        drop(state);
        self.completion_ready.notify_one();
    }

    /// Fail every outstanding URB locally (connection loss)
    pub(crate) fn fail_pending(&self, status: i32) {
        let mut state = self.state.lock().unwrap();
        let pending: Vec<UrbHeader> = state.pending.drain().map(|(_, h)| h).collect();
        for mut header in pending {
            header.status = status;
            header.transfer_length = 0;
            state.completions.push_back(Completion {
                header,
                data: Vec::new(),
            });
        }
        drop(state);
        self.completion_ready.notify_all();
    }
}
