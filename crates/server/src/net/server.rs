//! TCP server lifecycle
//!
//! Bind, scan, accept, stop. The listener runs non-blocking with a
//! short poll so `stop()` can preempt the accept loop without relying
//! on platform-specific socket tricks.

use crate::config::ServerConfig;
use crate::net::{session, SessionRegistry};
use crate::usb::inventory::Inventory;
use crate::usb::pump::UrbPump;
use anyhow::{Context as _, Result};
use protocol::CodecConfig;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// Poll interval of the accept loop; bounds shutdown latency
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// The AirUSB server
pub struct UsbServer {
    listener: TcpListener,
    inventory: Arc<Inventory>,
    registry: SessionRegistry,
    pump: Mutex<UrbPump>,
    codec: CodecConfig,
    running: Arc<AtomicBool>,
    next_session_id: AtomicU64,
    sessions: Mutex<Vec<JoinHandle<()>>>,
}

impl UsbServer {
    /// Initialize the backend, scan devices and bind the listener
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let inventory = Arc::new(Inventory::new().context("Failed to initialize USB backend")?);
        inventory.scan().context("Failed to scan USB devices")?;

        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .with_context(|| format!("Failed to bind {}", addr))?;
        listener
            .set_nonblocking(true)
            .context("Failed to configure listener")?;
        let local_addr = listener.local_addr()?;

        let registry = SessionRegistry::new();
        let pump = UrbPump::spawn(registry.clone());

        info!("AirUSB server listening on {}", local_addr);
        Ok(Self {
            listener,
            inventory,
            registry,
            pump: Mutex::new(pump),
            codec: CodecConfig {
                verify_crc: config.protocol.verify_crc,
            },
            running: Arc::new(AtomicBool::new(true)),
            next_session_id: AtomicU64::new(1),
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Accept connections until [`stop`](Self::stop) is called
    pub fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            let (stream, _) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        warn!("Accept failed: {}", e);
                    }
                    break;
                }
            };

            if let Err(e) = stream.set_nonblocking(false) {
                warn!("Rejecting connection: {}", e);
                continue;
            }
            // Completions are latency sensitive; do not batch them.
            let _ = stream.set_nodelay(true);

            let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
            let context = session::SessionContext {
                inventory: Arc::clone(&self.inventory),
                pump: self.pump.lock().unwrap().handle(),
                registry: self.registry.clone(),
                codec: self.codec,
            };
            match session::spawn_session(session_id, stream, context) {
                Ok(handle) => self.sessions.lock().unwrap().push(handle),
                Err(e) => warn!("Failed to spawn session worker: {}", e),
            }
        }

        // A connection accepted in the window between the stop signal
        // and the loop check still gets its socket shut down here.
        self.registry.shutdown_all();
        info!("Accept loop stopped");
    }

    /// Signal termination and release every resource
    ///
    /// Safe to call from another thread while [`run`](Self::run)
    /// blocks; returns once all session workers and the pump have
    /// joined.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping server");

        // Wake the session readers; each worker releases its own
        // attachments on the way out.
        self.registry.shutdown_all();

        let handles: Vec<_> = self.sessions.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        self.pump.lock().unwrap().shutdown();
        info!("AirUSB server stopped");
    }
}

impl Drop for UsbServer {
    fn drop(&mut self) {
        self.stop();
    }
}
