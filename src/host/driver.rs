//! Host controller driver interface

use crate::descriptor::EndpointDescriptor;
use crate::error::{Error, Result};
use crate::transfer::Transfer;
use crate::Speed;
use alloc::sync::Arc;

/// One endpoint of one attached device, as the driver sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEndpoint {
    pub device_address: u8,
    pub speed: Speed,
    pub descriptor: EndpointDescriptor,
}

impl HostEndpoint {
    /// The default control endpoint of a device
    pub fn control(device_address: u8, speed: Speed, max_packet_size: u16) -> Self {
        Self {
            device_address,
            speed,
            descriptor: EndpointDescriptor {
                address: 0,
                attributes: 0,
                max_packet_size,
                interval: 0,
            },
        }
    }

    /// Endpoint number, without the direction bit
    pub fn number(&self) -> u8 {
        self.descriptor.address & 0x0F
    }
}

/// A host controller
///
/// Like the device side, the driver completes transfers with
/// [`Transfer::complete()`], never from within `xfer_request`. A STALL
/// handshake completes the transfer with [`Error::Again`]; transaction
/// errors complete it with [`Error::Proto`].
///
/// Control transfers arrive as up to three requests on endpoint zero. The
/// SETUP stage carries [`TransferFlags::SETUP`](crate::transfer::TransferFlags::SETUP)
/// and the 8 byte request; the data and status stages follow once the
/// previous stage completed. The transfer's endpoint address carries the
/// direction of each stage.
pub trait HostDriver: Send + Sync {
    /// Start the controller and power the ports
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn suspend(&self) -> Result<()> {
        Err(Error::NotSup)
    }

    fn resume(&self) -> Result<()> {
        Err(Error::NotSup)
    }

    /// Initialize the root hub, after [`start()`](HostDriver::start)
    fn rh_init(&self) -> Result<()> {
        Ok(())
    }

    /// Prepare the controller to move data on `ep`
    fn ep_enable(&self, ep: &HostEndpoint) -> Result<()>;

    fn ep_disable(&self, ep: &HostEndpoint) -> Result<()>;

    fn xfer_request(&self, ep: &HostEndpoint, transfer: &Arc<Transfer>) -> Result<()>;

    /// Abandon `transfer`
    ///
    /// The stack completes the transfer with [`Error::Cancel`] after this
    /// returns, unless the hardware completed it first.
    fn xfer_cancel(&self, ep: &HostEndpoint, transfer: &Arc<Transfer>) -> Result<()>;

    /// The current (micro)frame number
    fn frame_num_get(&self) -> Result<u32>;
}
