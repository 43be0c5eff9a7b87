//! Host pipes

use super::device::DeviceEntry;
use super::{HostEndpoint, HostInner};
use crate::descriptor::EndpointDescriptor;
use crate::error::{Error, Result};
use crate::os::{Os, TimedMutex};
use crate::pipe::TransferPipe;
use crate::transfer::{HaltFlag, Transfer, TransferType};
use crate::Library;
use alloc::sync::{Arc, Weak};
use usb_device::endpoint::EndpointAddress;

/// A data pipe to one endpoint of an attached device
///
/// Dropping the pipe disables the endpoint in the controller.
pub struct HostPipe {
    host: Weak<HostInner>,
    lib: Library,
    device: Arc<DeviceEntry>,
    ep: HostEndpoint,
    halt: HaltFlag,
    sync: TimedMutex<()>,
    lock_timeout: u32,
}

impl HostPipe {
    pub(super) fn new(host: &Arc<HostInner>, device: Arc<DeviceEntry>, ep: HostEndpoint) -> Self {
        Self {
            host: Arc::downgrade(host),
            lib: Library::clone(&host.lib),
            halt: device.halt_flag(ep.descriptor.address),
            device,
            ep,
            sync: TimedMutex::new(()),
            lock_timeout: host.options.lock_timeout_ms,
        }
    }

    fn host(&self) -> Result<Arc<HostInner>> {
        if !self.device.is_connected() {
            return Err(Error::NoDev);
        }
        self.host.upgrade().ok_or(Error::NoDev)
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.ep.descriptor
    }

    pub(crate) fn host_endpoint(&self) -> &HostEndpoint {
        &self.ep
    }

    /// The controller's current (micro)frame number
    pub fn frame_number(&self) -> Result<u32> {
        self.host()?.frame_number()
    }
}

impl TransferPipe for HostPipe {
    fn endpoint(&self) -> EndpointAddress {
        self.ep.descriptor.endpoint_address()
    }
    fn transfer_type(&self) -> TransferType {
        self.ep.descriptor.transfer_type()
    }
    fn os(&self) -> &dyn Os {
        self.lib.os()
    }
    fn sync_lock(&self) -> &TimedMutex<()> {
        &self.sync
    }
    fn lock_timeout(&self) -> u32 {
        self.lock_timeout
    }
    fn dma_align(&self) -> usize {
        self.lib.dma().align()
    }
    fn submit(&self, transfer: &Arc<Transfer>) -> Result<()> {
        if transfer.endpoint() != self.endpoint() {
            return Err(Error::Inval);
        }
        self.host()?.submit_halting(&self.ep, transfer, Some(&self.halt))
    }
    fn cancel(&self, transfer: &Arc<Transfer>) -> Result<()> {
        match self.host.upgrade() {
            Some(host) => host.cancel(&self.ep, transfer),
            None => {
                transfer.complete(Err(Error::Cancel));
                Ok(())
            }
        }
    }
}

impl Drop for HostPipe {
    fn drop(&mut self) {
        let Ok(host) = self.host() else {
            return;
        };
        if let Err(err) = host.with_driver(|driver| driver.ep_disable(&self.ep)) {
            warn!(
                "dev {} EP{} disable: {:?}",
                self.ep.device_address,
                self.ep.number(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::pipe::TransferPipe;
    use crate::testing::{self, HostEvent};
    use crate::os::StdOs;
    use crate::transfer::{Transfer, TransferType};
    use crate::{Error, Library};
    use alloc::sync::Arc;
    use usb_device::endpoint::EndpointAddress;

    #[test]
    fn bulk_read_and_write() {
        let fixture = testing::host();
        let device = fixture.attach();
        let bulk_in = device.pipe_open(0x81).unwrap();
        let bulk_out = device.pipe_open(0x02).unwrap();
        fixture.driver.set_responder(|transfer| {
            if u8::from(transfer.endpoint()) == 0x81 {
                transfer.with_buffer(|buf| buf[..4].copy_from_slice(b"pong"));
                Some(Ok(4))
            } else {
                Some(Ok(transfer.length()))
            }
        });
        assert_eq!(bulk_out.write(b"ping", 1000), Ok(4));
        let mut buf = [0; 64];
        assert_eq!(bulk_in.read(&mut buf, 1000), Ok(4));
        assert_eq!(&buf[..4], b"pong");
        assert_eq!(bulk_in.write(b"x", 1000), Err(Error::Inval));
        assert!(fixture
            .driver
            .events()
            .contains(&HostEvent::Xfer(device.address(), 0x02, 4)));
    }

    #[test]
    fn read_times_out() {
        let fixture = testing::host();
        let device = fixture.attach();
        let bulk_in = device.pipe_open(0x81).unwrap();
        let mut buf = [0; 64];
        assert_eq!(bulk_in.read(&mut buf, 30), Err(Error::Time));
        assert!(fixture
            .driver
            .events()
            .contains(&HostEvent::Cancel(device.address(), 0x81)));
    }

    #[test]
    fn timeout_with_a_failing_cancel() {
        let fixture = testing::host();
        let device = fixture.attach();
        let bulk_in = device.pipe_open(0x81).unwrap();
        fixture.driver.set_cancel_fault(Error::Fault);
        let mut buf = [0; 64];
        assert_eq!(bulk_in.read(&mut buf, 30), Err(Error::Time));

        // The pipe stays usable.
        fixture.driver.set_responder(|_| Some(Ok(3)));
        assert_eq!(bulk_in.read(&mut buf, 1000), Ok(3));
    }

    #[test]
    fn stalled_endpoint_refuses_transfers_until_cleared() {
        let fixture = testing::host();
        let device = fixture.attach();
        let bulk_in = device.pipe_open(0x81).unwrap();
        let bulk_out = device.pipe_open(0x02).unwrap();
        fixture.driver.set_responder(|_| Some(Err(Error::Again)));
        let mut buf = [0; 64];
        assert_eq!(bulk_in.read(&mut buf, 1000), Err(Error::Again));
        assert!(device.is_halted(0x81));
        assert!(!device.is_halted(0x02));

        let reads = |events: &[HostEvent]| {
            events
                .iter()
                .filter(|event| matches!(event, HostEvent::Xfer(_, 0x81, _)))
                .count()
        };
        assert_eq!(reads(&fixture.driver.events()), 1);
        assert_eq!(bulk_in.read(&mut buf, 1000), Err(Error::Again));
        assert_eq!(reads(&fixture.driver.events()), 1);

        // Other endpoints keep moving.
        fixture.driver.set_responder(|transfer| Some(Ok(transfer.length())));
        assert_eq!(bulk_out.write(b"data", 1000), Ok(4));

        device.clear_halt(0x81).unwrap();
        assert!(!device.is_halted(0x81));
        assert_eq!(bulk_in.read(&mut buf, 1000), Ok(64));
        assert_eq!(reads(&fixture.driver.events()), 2);
    }

    #[test]
    fn buffers_meet_the_mapper_alignment() {
        let lib = Library::new(Arc::new(StdOs::new()), Arc::new(testing::CacheLines));
        let fixture = testing::host_with(&lib);
        // Enumeration moves every control stage through the mapper.
        let device = fixture.attach();
        let bulk_in = device.pipe_open(0x81).unwrap();
        fixture.driver.set_responder(|transfer| {
            let addr = transfer.dma_addr().unwrap_or(1);
            Some(if addr % 32 == 0 { Ok(5) } else { Err(Error::Fault) })
        });
        let mut buf = [0; 13];
        assert_eq!(bulk_in.read(&mut buf, 1000), Ok(5));
    }

    #[test]
    fn disconnect_fails_transfers() {
        let fixture = testing::host();
        let device = fixture.attach();
        let bulk_out = device.pipe_open(0x02).unwrap();
        fixture.host.port_disconnected(0).unwrap();
        assert_eq!(bulk_out.write(b"data", 100), Err(Error::NoDev));
        assert_eq!(bulk_out.frame_number(), Err(Error::NoDev));
    }

    #[test]
    fn wrong_endpoint_is_rejected() {
        let fixture = testing::host();
        let device = fixture.attach();
        let bulk_out = device.pipe_open(0x02).unwrap();
        let transfer = Transfer::builder(EndpointAddress::from(0x81), TransferType::Bulk)
            .capacity(8)
            .build();
        assert_eq!(bulk_out.submit(&transfer), Err(Error::Inval));
    }
}
