//! Device controller driver interface

use crate::descriptor::EndpointDescriptor;
use crate::error::{Error, Result};
use crate::transfer::Transfer;
use alloc::sync::Arc;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// A device (peripheral) controller
///
/// The stack calls these methods to drive the hardware. The driver reports
/// events back through [`Device`](super::Device): bus resets, SETUP packets,
/// suspend and resume. It completes transfers with
/// [`Transfer::complete()`].
///
/// `xfer_request` must not complete the transfer before returning; the
/// completion belongs to the interrupt handler, or to whatever context the
/// hardware signals from.
pub trait DeviceDriver: Send + Sync {
    /// Put the controller into a known state
    fn reset(&self) -> Result<()> {
        Ok(())
    }

    /// Start the controller
    fn run(&self) -> Result<()>;

    /// Stop the controller
    fn stop(&self) -> Result<()>;

    /// Start moving data for `transfer`
    ///
    /// Endpoint zero transfers in both directions go through here too.
    fn xfer_request(&self, transfer: &Arc<Transfer>) -> Result<()>;

    /// Abandon `transfer`
    ///
    /// The stack completes the transfer with [`Error::Cancel`] after this
    /// returns, unless the hardware already completed it.
    fn xfer_cancel(&self, transfer: &Arc<Transfer>) -> Result<()>;

    fn ep_enable(&self, desc: &EndpointDescriptor) -> Result<()>;

    fn ep_disable(&self, address: EndpointAddress) -> Result<()>;

    /// Set or clear the endpoint halt (stall) condition
    fn ep_halt(&self, address: EndpointAddress, halt: bool) -> Result<()>;

    /// Reset the endpoint's data toggle
    fn ep_reset(&self, address: EndpointAddress) -> Result<()> {
        let _ = address;
        Ok(())
    }

    /// Stall both directions of endpoint zero
    ///
    /// The hardware clears the condition on the next SETUP packet.
    fn ep0_stall(&self) -> Result<()> {
        self.ep_halt(EndpointAddress::from_parts(0, UsbDirection::In), true)?;
        self.ep_halt(EndpointAddress::from_parts(0, UsbDirection::Out), true)
    }

    fn addr_set(&self, address: u8) -> Result<()>;

    /// The host selected configuration `value`; zero means none
    fn config_set(&self, value: u8) -> Result<()> {
        let _ = value;
        Ok(())
    }

    /// Signal remote wakeup
    fn wakeup(&self) -> Result<()> {
        Err(Error::NotSup)
    }

    /// Connect or disconnect the D+ pull-up
    fn pullup(&self, on: bool) -> Result<()> {
        let _ = on;
        Ok(())
    }

    /// The hardware applies a new address before the status stage of
    /// SET_ADDRESS
    ///
    /// When `false`, the stack calls [`addr_set()`](DeviceDriver::addr_set)
    /// after the status stage.
    fn set_address_before_status(&self) -> bool {
        false
    }
}
