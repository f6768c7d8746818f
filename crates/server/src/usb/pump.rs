//! URB pump
//!
//! A single backend thread executes every submitted URB and routes the
//! completion back to the owning session. Submissions from all
//! sessions are serialized through one command queue, which directly
//! gives the per-endpoint completion ordering guarantee.

use crate::net::{SessionId, SessionRegistry};
use crate::usb::device::UsbDevice;
use crate::usb::transfers::{self, TransferOutcome};
use protocol::{Envelope, Message, UrbHeader};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Routing context attached to every submission
///
/// Completions are routed by id lookup only; the pump never holds a
/// reference into session state.
#[derive(Debug, Clone, Copy)]
pub struct UrbContext {
    pub session_id: SessionId,
    pub device_id: u32,
    pub urb_id: u64,
    /// Envelope sequence of the submitting frame, echoed in the
    /// completion
    pub sequence: u32,
}

/// Commands accepted by the pump thread
pub enum PumpCommand {
    Submit {
        ctx: UrbContext,
        header: UrbHeader,
        data: Vec<u8>,
        device: Arc<Mutex<UsbDevice>>,
        /// Pending table of the owning attachment; the urb id is
        /// removed once the completion is produced
        pending: Arc<Mutex<HashSet<u64>>>,
    },
    Shutdown,
}

/// Cancellation marks consulted by the pump before executing a URB
///
/// `UsbUnlinkUrb` and detach mark `(session, urb)` pairs here; a
/// marked URB completes with `-ECANCELED` without touching the device.
#[derive(Clone, Default)]
pub struct CancelSet {
    marks: Arc<Mutex<HashSet<(SessionId, u64)>>>,
}

impl CancelSet {
    pub fn mark(&self, session_id: SessionId, urb_id: u64) {
        self.marks.lock().unwrap().insert((session_id, urb_id));
    }

    /// Consume a mark, returning whether it was present
    pub fn take(&self, session_id: SessionId, urb_id: u64) -> bool {
        self.marks.lock().unwrap().remove(&(session_id, urb_id))
    }

    /// Drop every mark a session left behind
    pub fn clear_session(&self, session_id: SessionId) {
        self.marks
            .lock()
            .unwrap()
            .retain(|(session, _)| *session != session_id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.marks.lock().unwrap().len()
    }
}

/// Handle for submitting work to the pump thread
#[derive(Clone)]
pub struct PumpHandle {
    commands: async_channel::Sender<PumpCommand>,
    cancels: CancelSet,
}

impl PumpHandle {
    /// Queue a command; returns false if the pump has stopped
    pub fn submit(&self, command: PumpCommand) -> bool {
        self.commands.send_blocking(command).is_ok()
    }

    pub fn cancels(&self) -> &CancelSet {
        &self.cancels
    }
}

/// The pump thread itself
pub struct UrbPump {
    handle: PumpHandle,
    thread: Option<JoinHandle<()>>,
}

impl UrbPump {
    /// Spawn the pump thread
    pub fn spawn(registry: SessionRegistry) -> Self {
        let (tx, rx) = async_channel::unbounded::<PumpCommand>();
        let cancels = CancelSet::default();
        let handle = PumpHandle {
            commands: tx,
            cancels: cancels.clone(),
        };

        let thread = thread::Builder::new()
            .name("urb-pump".to_string())
            .spawn(move || run_pump(rx, cancels, registry))
            .expect("failed to spawn URB pump thread");

        Self {
            handle,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> PumpHandle {
        self.handle.clone()
    }

    /// Stop the pump and join its thread
    pub fn shutdown(&mut self) {
        let _ = self.handle.submit(PumpCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for UrbPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_pump(
    commands: async_channel::Receiver<PumpCommand>,
    cancels: CancelSet,
    registry: SessionRegistry,
) {
    info!("URB pump started");

    while let Ok(command) = commands.recv_blocking() {
        match command {
            PumpCommand::Shutdown => break,
            PumpCommand::Submit {
                ctx,
                mut header,
                data,
                device,
                pending,
            } => {
                let outcome = if cancels.take(ctx.session_id, ctx.urb_id) {
                    debug!(urb_id = ctx.urb_id, "URB cancelled before execution");
                    TransferOutcome::failure(transfers::ECANCELED)
                } else {
                    let device = device.lock().unwrap();
                    match device.handle() {
                        Some(handle) => {
                            let outcome = transfers::execute(handle, &header, &data);
                            // A cancel that lost the race is stale now.
                            cancels.take(ctx.session_id, ctx.urb_id);
                            outcome
                        }
                        None => TransferOutcome::failure(transfers::ENODEV),
                    }
                };

                pending.lock().unwrap().remove(&ctx.urb_id);

                // urb_id and device_id travel back verbatim.
                header.status = outcome.status;
                header.transfer_length = outcome.actual_length;
                let completion = Envelope::new(
                    ctx.sequence,
                    Message::CompleteUrb {
                        header,
                        data: outcome.data,
                    },
                );
                if !registry.send_to(ctx.session_id, completion) {
                    warn!(
                        session_id = ctx.session_id,
                        device_id = ctx.device_id,
                        urb_id = ctx.urb_id,
                        "Completion dropped: session gone"
                    );
                }
            }
        }
    }

    info!("URB pump stopped");
}
