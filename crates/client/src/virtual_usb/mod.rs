//! Virtual device registry and the local sink interface

pub mod device;
pub mod sink;

pub use device::{Completion, VirtualDevice};
pub use sink::DeviceSink;
