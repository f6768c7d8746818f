//! Local device sink interface
//!
//! The sink is the kernel-facing collaborator that turns virtual
//! devices into something the local operating system can use. The
//! client core only depends on this trait; the concrete vhci-style
//! integration lives outside the core.

use crate::virtual_usb::device::{Completion, VirtualDevice};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Bounded wait used when polling a device's completion queue
const COMPLETION_POLL: Duration = Duration::from_millis(100);

/// Consumer of attached virtual devices and their completions
pub trait DeviceSink: Send + Sync {
    /// Make a newly attached device available locally
    fn register(&self, device: Arc<VirtualDevice>) -> common::Result<()>;

    /// Remove a device (detach or disconnect)
    fn unregister(&self, device_id: u32) -> common::Result<()>;

    /// Hand one completed URB to the local consumer
    fn deliver(&self, device_id: u32, completion: Completion);
}

/// Spawn the response-handler thread for one virtual device
///
/// Drains the device's completion queue into the sink until `running`
/// clears or the connection drops.
pub fn spawn_response_handler(
    device: Arc<VirtualDevice>,
    sink: Arc<dyn DeviceSink>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("responses-{}", device.device_id()))
        .spawn(move || {
            let device_id = device.device_id();
            while running.load(Ordering::SeqCst) && device.is_connected() {
                if let Some(completion) = device.next_completion(COMPLETION_POLL) {
                    sink.deliver(device_id, completion);
                }
            }
            // Flush whatever is already queued before exiting.
            while let Some(completion) = device.next_completion(Duration::ZERO) {
                sink.deliver(device_id, completion);
            }
            debug!(device_id, "Response handler stopped");
        })
        .expect("failed to spawn response handler thread")
}
