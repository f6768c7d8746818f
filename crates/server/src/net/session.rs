//! Per-connection session worker
//!
//! Each accepted connection gets two threads: a reader that decodes
//! frames and drives the broker state machine, and a writer that
//! drains the session's outbound queue to the socket. Splitting the
//! send side keeps a blocked peer from stalling the URB pump or any
//! other session.

use crate::net::{SessionId, SessionRegistry};
use crate::usb::device::UsbDevice;
use crate::usb::inventory::{AttachError, Inventory};
use crate::usb::pump::{PumpCommand, PumpHandle, UrbContext};
use crate::usb::transfers;
use protocol::{
    read_frame, write_frame, CodecConfig, Envelope, Message, ProtocolError, UrbHeader,
};
use std::collections::{HashMap, HashSet};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// One attached device from this session's point of view
///
/// `pending` is the URB table of the device handle: ids in flight on
/// the pump that have not completed yet.
struct Attachment {
    device: Arc<Mutex<UsbDevice>>,
    pending: Arc<Mutex<HashSet<u64>>>,
}

/// Everything a session worker needs from the server
pub struct SessionContext {
    pub inventory: Arc<Inventory>,
    pub pump: PumpHandle,
    pub registry: SessionRegistry,
    pub codec: CodecConfig,
}

/// Spawn the reader and writer threads for an accepted connection
pub fn spawn_session(
    session_id: SessionId,
    stream: TcpStream,
    context: SessionContext,
) -> std::io::Result<JoinHandle<()>> {
    let peer = stream.peer_addr()?;
    info!(session_id, %peer, "Client connected");

    let (outbound_tx, outbound_rx) = async_channel::unbounded::<Envelope>();
    context
        .registry
        .register(session_id, outbound_tx.clone(), stream.try_clone()?);

    let writer_stream = stream.try_clone()?;
    let writer = thread::Builder::new()
        .name(format!("session-{}-writer", session_id))
        .spawn(move || write_loop(writer_stream, outbound_rx))?;

    thread::Builder::new()
        .name(format!("session-{}", session_id))
        .spawn(move || {
            let mut worker = SessionWorker {
                session_id,
                context,
                outbound: outbound_tx,
                attachments: HashMap::new(),
            };
            worker.read_loop(stream);
            worker.teardown(writer);
        })
}

/// Drain the outbound queue onto the socket
///
/// A write failure shuts the socket down, which makes the reader exit
/// and release the session's attachments.
fn write_loop(mut stream: TcpStream, outbound: async_channel::Receiver<Envelope>) {
    while let Ok(envelope) = outbound.recv_blocking() {
        if let Err(e) = write_frame(&mut stream, &envelope) {
            warn!("Session send failed: {}", e);
            let _ = stream.shutdown(Shutdown::Both);
            break;
        }
    }
}

struct SessionWorker {
    session_id: SessionId,
    context: SessionContext,
    outbound: async_channel::Sender<Envelope>,
    attachments: HashMap<u32, Attachment>,
}

impl SessionWorker {
    fn read_loop(&mut self, mut stream: TcpStream) {
        loop {
            let envelope = match read_frame(&mut stream, &self.context.codec) {
                Ok(envelope) => envelope,
                Err(ProtocolError::Io(e)) => {
                    debug!(session_id = self.session_id, "Connection closed: {}", e);
                    break;
                }
                Err(e) => {
                    warn!(session_id = self.session_id, "Fatal frame error: {}", e);
                    break;
                }
            };

            if !self.dispatch(envelope) {
                break;
            }
        }
    }

    /// Handle one frame; returns false when the connection must close
    fn dispatch(&mut self, envelope: Envelope) -> bool {
        let sequence = envelope.sequence;
        match envelope.message {
            Message::DeviceListRequest => {
                let devices = self.context.inventory.list();
                debug!(
                    session_id = self.session_id,
                    count = devices.len(),
                    "Device list requested"
                );
                self.respond(sequence, Message::DeviceListResponse { devices })
            }
            Message::DeviceAttachRequest { device_id } => {
                let success = self.handle_attach(device_id);
                self.respond(sequence, Message::DeviceAttachResponse { success })
            }
            Message::DeviceDetachRequest { device_id } => {
                self.handle_detach(device_id);
                // Idempotent: unknown ids detach successfully.
                self.respond(sequence, Message::DeviceDetachResponse { success: true })
            }
            Message::SubmitUrb { header, data } => self.handle_submit(sequence, header, data),
            Message::UnlinkUrb { header } => {
                self.handle_unlink(header);
                true
            }
            other => {
                // Clients have no business sending responses,
                // completions or bulk streams here.
                warn!(
                    session_id = self.session_id,
                    "Unexpected message type {:#04x} from client",
                    other.kind() as u8
                );
                self.respond(
                    sequence,
                    Message::Error {
                        message: format!("Unexpected message type {:#04x}", other.kind() as u8),
                    },
                );
                false
            }
        }
    }

    fn handle_attach(&mut self, device_id: u32) -> bool {
        // Attaching a device this session already holds is a success.
        if self.attachments.contains_key(&device_id) {
            debug!(
                session_id = self.session_id,
                device_id, "Device already attached to this session"
            );
            return true;
        }

        match self.context.inventory.attach(device_id, self.session_id) {
            Ok(device) => {
                self.attachments.insert(
                    device_id,
                    Attachment {
                        device,
                        pending: Arc::new(Mutex::new(HashSet::new())),
                    },
                );
                true
            }
            Err(e @ AttachError::AlreadyAttached(_)) => {
                info!(session_id = self.session_id, "{}", e);
                false
            }
            Err(e) => {
                warn!(session_id = self.session_id, "Attach failed: {}", e);
                false
            }
        }
    }

    fn handle_detach(&mut self, device_id: u32) {
        if let Some(attachment) = self.attachments.remove(&device_id) {
            self.cancel_pending(&attachment);
            self.context.inventory.detach(device_id, self.session_id);
        }
    }

    fn handle_submit(&mut self, sequence: u32, header: UrbHeader, data: Vec<u8>) -> bool {
        let attachment = match self.attachments.get(&header.device_id) {
            Some(attachment) => attachment,
            None => {
                // Submission rejected: answer with a completion
                // carrying the errno, not with a protocol error.
                debug!(
                    session_id = self.session_id,
                    device_id = header.device_id,
                    "URB for unattached device"
                );
                let mut completion = header;
                completion.status = -transfers::ENODEV;
                completion.transfer_length = 0;
                return self.respond(
                    sequence,
                    Message::CompleteUrb {
                        header: completion,
                        data: Vec::new(),
                    },
                );
            }
        };

        attachment.pending.lock().unwrap().insert(header.urb_id);
        let accepted = self.context.pump.submit(PumpCommand::Submit {
            ctx: UrbContext {
                session_id: self.session_id,
                device_id: header.device_id,
                urb_id: header.urb_id,
                sequence,
            },
            header,
            data,
            device: Arc::clone(&attachment.device),
            pending: Arc::clone(&attachment.pending),
        });

        if !accepted {
            attachment.pending.lock().unwrap().remove(&header.urb_id);
            let mut completion = header;
            completion.status = -transfers::EIO;
            completion.transfer_length = 0;
            return self.respond(
                sequence,
                Message::CompleteUrb {
                    header: completion,
                    data: Vec::new(),
                },
            );
        }
        true
    }

    fn handle_unlink(&mut self, header: UrbHeader) {
        let still_pending = self
            .attachments
            .get(&header.device_id)
            .map(|a| a.pending.lock().unwrap().contains(&header.urb_id))
            .unwrap_or(false);

        if still_pending {
            debug!(
                session_id = self.session_id,
                urb_id = header.urb_id,
                "Unlink requested"
            );
            self.context
                .pump
                .cancels()
                .mark(self.session_id, header.urb_id);
        }
        // Already completed (or never submitted): the completion that
        // was or will be delivered is the authoritative answer.
    }

    /// Mark every in-flight URB of an attachment as cancelled
    fn cancel_pending(&self, attachment: &Attachment) {
        let pending: Vec<u64> = attachment.pending.lock().unwrap().iter().copied().collect();
        for urb_id in pending {
            self.context.pump.cancels().mark(self.session_id, urb_id);
        }
    }

    fn respond(&self, sequence: u32, message: Message) -> bool {
        self.outbound
            .send_blocking(Envelope::new(sequence, message))
            .is_ok()
    }

    /// Release all resources after the read loop exits
    ///
    /// Closing the devices fails any still-queued URBs for this
    /// session; their completions are dropped at the registry since
    /// the session is unregistered first.
    fn teardown(&mut self, writer: JoinHandle<()>) {
        self.context.registry.unregister(self.session_id);

        self.attachments.clear();
        self.context.inventory.release_session(self.session_id);
        self.context.pump.cancels().clear_session(self.session_id);

        // Closing our sender lets the writer flush and exit.
        self.outbound.close();
        let _ = writer.join();
        info!(session_id = self.session_id, "Client disconnected");
    }
}
