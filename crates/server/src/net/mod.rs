//! Network layer: TCP server, per-session workers, session registry

pub mod server;
pub mod session;

use protocol::Envelope;
use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Identifier of one accepted client connection
pub type SessionId = u64;

struct SessionHandle {
    outbound: async_channel::Sender<Envelope>,
    stream: TcpStream,
}

/// Registry of live sessions
///
/// URB completions carry a session id and are routed through here,
/// which breaks the pump -> session -> device -> session reference
/// cycle: the pump only ever holds the registry and an id. The lock is
/// held just long enough to clone a sender, never across socket I/O.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session's outbound queue and socket
    pub fn register(
        &self,
        session_id: SessionId,
        outbound: async_channel::Sender<Envelope>,
        stream: TcpStream,
    ) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id, SessionHandle { outbound, stream });
    }

    /// Drop a session; later sends to it are discarded
    pub fn unregister(&self, session_id: SessionId) {
        self.sessions.lock().unwrap().remove(&session_id);
    }

    /// Queue an envelope for a session's writer
    ///
    /// Returns false if the session is gone. The outbound queue is
    /// unbounded, so this never blocks the caller on a slow peer.
    pub fn send_to(&self, session_id: SessionId, envelope: Envelope) -> bool {
        let sender = match self.sessions.lock().unwrap().get(&session_id) {
            Some(handle) => handle.outbound.clone(),
            None => {
                debug!(session_id, "Dropping frame for dead session");
                return false;
            }
        };
        sender.send_blocking(envelope).is_ok()
    }

    /// Shut down every session socket (server stop path)
    pub fn shutdown_all(&self) {
        for handle in self.sessions.lock().unwrap().values() {
            let _ = handle.stream.shutdown(Shutdown::Both);
        }
    }
}
