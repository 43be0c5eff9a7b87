//! A portable USB host and device stack
//!
//! `usbstack` implements the protocol side of USB: descriptors, the control
//! transfer state machine, configuration and endpoint bookkeeping, transfer
//! submission with timeouts, and a handful of class drivers. It never touches
//! registers. Each controller is reached through a driver trait that you
//! implement for your hardware:
//!
//! - [`device::DeviceDriver`] for a device (peripheral) controller,
//! - [`host::HostDriver`] for a host controller.
//!
//! Everything starts with a [`Library`], which carries the [`os::Os`] clock
//! and the [`dma::DmaMapper`] used to prepare transfer buffers.
//!
//! # Device example
//!
//! ```
//! use std::sync::Arc;
//! use usbstack::{
//!     descriptor::DeviceDescriptor,
//!     device::{Device, DeviceOptions, TypeSupport},
//!     dma::Coherent,
//!     Library,
//! };
//! # use usbstack::{device::DeviceDriver, transfer::Transfer, descriptor::EndpointDescriptor};
//! # use usb_device::endpoint::EndpointAddress;
//! # struct Clock;
//! # impl usbstack::os::Os for Clock {
//! #     fn now_ms(&self) -> u64 { 0 }
//! #     fn delay_ms(&self, _: u32) {}
//! # }
//! # struct Hardware;
//! # impl DeviceDriver for Hardware {
//! #     fn run(&self) -> usbstack::Result<()> { Ok(()) }
//! #     fn stop(&self) -> usbstack::Result<()> { Ok(()) }
//! #     fn xfer_request(&self, _: &Arc<Transfer>) -> usbstack::Result<()> { Ok(()) }
//! #     fn xfer_cancel(&self, _: &Arc<Transfer>) -> usbstack::Result<()> { Ok(()) }
//! #     fn ep_enable(&self, _: &EndpointDescriptor) -> usbstack::Result<()> { Ok(()) }
//! #     fn ep_disable(&self, _: EndpointAddress) -> usbstack::Result<()> { Ok(()) }
//! #     fn ep_halt(&self, _: EndpointAddress, _: bool) -> usbstack::Result<()> { Ok(()) }
//! #     fn addr_set(&self, _: u8) -> usbstack::Result<()> { Ok(()) }
//! # }
//!
//! let lib = Library::new(Arc::new(Clock), Arc::new(Coherent));
//! let device = Device::new(
//!     &lib,
//!     Arc::new(Hardware),
//!     DeviceDescriptor { id_vendor: 0x1209, id_product: 0x0001, ..Default::default() },
//!     DeviceOptions::default(),
//! )
//! .unwrap();
//! for number in 1..8 {
//!     device.ep_register(0x80 | number, TypeSupport::all(), 512).unwrap();
//!     device.ep_register(number, TypeSupport::all(), 512).unwrap();
//! }
//! let config = device.add_config(None).unwrap();
//! # let _ = config;
//! ```

#![no_std]

extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

#[macro_use]
mod log;

#[cfg(target_arch = "arm")]
mod cache;
pub mod class;
pub mod descriptor;
pub mod device;
pub mod dma;
mod error;
pub mod host;
pub mod os;
pub mod pipe;
pub mod refcnt;
pub mod setup;
#[cfg(test)]
mod testing;
pub mod transfer;
pub mod unicode;

pub use error::{Error, Result};

use alloc::sync::Arc;

/// Maximum number of configurations per device
pub const CONFIG_NUM_MAX: usize = 4;

/// Maximum number of interface numbers per configuration
pub const INTERFACE_NUM_MAX: usize = 16;

/// Default size of the endpoint 0 transfer buffer
///
/// Every configuration descriptor must fit this buffer.
pub const EP0_BUFFER_SIZE: usize = 1024;

/// Default bound on acquiring a controller or pipe lock, in milliseconds
pub const LOCK_TIMEOUT_MS: u32 = 5000;

/// Wait without a timeout
pub const WAIT_FOREVER: u32 = u32::MAX;

/// Bus speeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Speed {
    /// 1.5 Mbit/s
    Low,
    /// 12 Mbit/s
    Full,
    /// 480 Mbit/s
    High,
}

/// The stack context
///
/// Construct one `Library` and build every controller from it. Controllers
/// keep a handle to the library; [`controllers()`](Library::controllers)
/// reports how many are alive.
#[derive(Clone)]
pub struct Library {
    os: Arc<dyn os::Os>,
    dma: Arc<dyn dma::DmaMapper>,
    handles: Arc<refcnt::RefCount>,
}

impl Library {
    pub fn new(os: Arc<dyn os::Os>, dma: Arc<dyn dma::DmaMapper>) -> Self {
        Self {
            os,
            dma,
            handles: Arc::new(refcnt::RefCount::new()),
        }
    }

    pub fn os(&self) -> &dyn os::Os {
        &*self.os
    }

    pub fn dma(&self) -> &Arc<dyn dma::DmaMapper> {
        &self.dma
    }

    /// Returns the number of live controllers built from this library
    pub fn controllers(&self) -> usize {
        self.handles.count().saturating_sub(1)
    }

    /// Take a handle for a new controller
    pub(crate) fn acquire(&self) -> Result<LibraryHandle> {
        self.handles.get()?;
        Ok(LibraryHandle { lib: self.clone() })
    }
}

/// A controller's claim on its [`Library`]
pub(crate) struct LibraryHandle {
    lib: Library,
}

impl core::ops::Deref for LibraryHandle {
    type Target = Library;
    fn deref(&self) -> &Library {
        &self.lib
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        let _ = self.lib.handles.put(|| {});
    }
}
