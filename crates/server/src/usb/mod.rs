//! USB backend layer: device wrappers, inventory, transfer execution
//! and the URB pump thread

pub mod device;
pub mod inventory;
pub mod pump;
pub mod transfers;
