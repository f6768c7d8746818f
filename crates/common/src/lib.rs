//! Shared plumbing for the AirUSB server and client

pub mod error;
pub mod logging;
pub mod shutdown;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use shutdown::{install_interrupt_handler, interrupted, wait_for_interrupt};
