//! Microsoft OS 1.0 descriptors (WCID)
//!
//! Windows reads string descriptor 0xEE once per device. If it holds the
//! "MSFT100" signature, Windows asks for the extended compat ID descriptor
//! with a vendor request using the vendor code from that string, and binds
//! the listed interfaces to the named driver, usually WinUSB, without an INF
//! file.

use crate::device::{strings, ControlReply, Device, FunctionOps};
use crate::error::{Error, Result};
use crate::setup::SetupPacket;
use alloc::{sync::Arc, vec::Vec};
use usb_device::control::RequestType;
use usb_device::UsbDirection;

/// `wIndex` of the extended compat ID feature descriptor request
const EXTENDED_COMPAT_ID: u16 = 0x0004;

/// One interface and the driver Windows binds to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatId {
    pub first_interface: u8,
    pub compatible_id: [u8; 8],
    pub sub_compatible_id: [u8; 8],
}

impl CompatId {
    /// Bind `first_interface` to WinUSB
    pub fn winusb(first_interface: u8) -> Self {
        Self {
            first_interface,
            compatible_id: *b"WINUSB\0\0",
            sub_compatible_id: [0; 8],
        }
    }
}

/// The MS OS string descriptor, for index 0xEE
pub fn os_string_descriptor(vendor_code: u8) -> Vec<u8> {
    let mut desc = Vec::with_capacity(18);
    desc.extend_from_slice(&[18, crate::descriptor::descriptor_type::STRING]);
    for ch in b"MSFT100" {
        desc.extend_from_slice(&[*ch, 0]);
    }
    desc.extend_from_slice(&[vendor_code, 0]);
    desc
}

/// The extended compat ID feature descriptor
pub fn compat_id_descriptor(functions: &[CompatId]) -> Vec<u8> {
    let len = 16 + 24 * functions.len();
    let mut desc = Vec::with_capacity(len);
    desc.extend_from_slice(&(len as u32).to_le_bytes());
    desc.extend_from_slice(&0x0100u16.to_le_bytes());
    desc.extend_from_slice(&EXTENDED_COMPAT_ID.to_le_bytes());
    desc.push(functions.len() as u8);
    desc.extend_from_slice(&[0; 7]);
    for function in functions {
        desc.push(function.first_interface);
        desc.push(1);
        desc.extend_from_slice(&function.compatible_id);
        desc.extend_from_slice(&function.sub_compatible_id);
        desc.extend_from_slice(&[0; 6]);
    }
    desc
}

struct WcidOps {
    vendor_code: u8,
    descriptor: Vec<u8>,
}

impl FunctionOps for WcidOps {
    fn setup(&self, setup: &SetupPacket) -> Result<ControlReply> {
        let matches = setup.request_kind() == RequestType::Vendor
            && setup.request == self.vendor_code
            && setup.direction() == UsbDirection::In;
        match setup.index {
            EXTENDED_COMPAT_ID if matches => Ok(ControlReply::data_in(self.descriptor.clone())),
            _ => Err(Error::NotSup),
        }
    }
}

/// Install the MS OS string and the compat ID answer on `device`
///
/// Pick a `vendor_code` that no other vendor request of the device uses.
pub fn install(device: &Device, vendor_code: u8, functions: &[CompatId]) -> Result<()> {
    if functions.is_empty() {
        return Err(Error::Inval);
    }
    device.set_string_descriptor(strings::MS_OS, os_string_descriptor(vendor_code))?;
    device.set_vendor_handler(Arc::new(WcidOps {
        vendor_code,
        descriptor: compat_id_descriptor(functions),
    }))?;
    debug!("WCID vendor code {:x}", vendor_code);
    Ok(())
}
