//! Cooperative shutdown on SIGINT/SIGTERM
//!
//! The handler only flips an atomic flag; threads poll it between I/O
//! operations and unwind cooperatively.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers that set the interrupt flag
pub fn install_interrupt_handler() {
    unsafe {
        libc::signal(
            libc::SIGINT,
            handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
}

/// Whether an interrupt signal has been received
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Block until an interrupt signal arrives
pub fn wait_for_interrupt() {
    while !interrupted() {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
}
