//! Device class drivers
//!
//! Each driver adds its interfaces and pipes to a configuration of a
//! [`Device`](crate::device::Device), answers its class requests, and moves
//! data with synchronous pipe calls. Build them before
//! [`run()`](crate::device::Device::run).

pub mod cdc;
pub mod hid;
pub mod msc;
pub mod printer;
pub mod wcid;

use crate::setup::SetupPacket;
use usb_device::control::{Recipient, RequestType};

/// Is `setup` a class request addressed to `interface`?
fn is_class_request(setup: &SetupPacket, interface: u8) -> bool {
    setup.request_kind() == RequestType::Class
        && setup.recipient() == Recipient::Interface
        && setup.index as u8 == interface
}
