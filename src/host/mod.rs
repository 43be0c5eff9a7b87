//! Host stack
//!
//! A [`Host`] owns one host controller: the device addresses, the attached
//! devices, and transfer submission. The controller driver reports port
//! events with [`port_connected()`](Host::port_connected) and
//! [`port_disconnected()`](Host::port_disconnected). A connect enumerates the
//! device and selects its first configuration.
//!
//! Attached devices are reference counted. [`HostDevice`] is a counted
//! handle; the device's address returns to the pool once it's disconnected
//! and the last handle is gone.

mod config;
mod control;
mod device;
mod driver;
mod enumerate;
mod pipe;
pub mod uac;

pub use config::{HostConfig, HostInterface, InterfaceAlt};
pub use device::HostDevice;
pub use driver::{HostDriver, HostEndpoint};
pub use pipe::HostPipe;

use crate::error::{Error, Result};
use crate::os::TimedMutex;
use crate::transfer::{HaltFlag, Transfer};
use crate::{Library, LibraryHandle, Speed, LOCK_TIMEOUT_MS};
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};
use device::DeviceEntry;
use spin::Mutex;

/// Run time host options
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Bound on each control transfer during enumeration, in milliseconds
    pub enumeration_timeout_ms: u32,
    /// Bound on control transfers the stack issues for you afterwards
    pub control_timeout_ms: u32,
    /// Bound on acquiring the controller lock
    pub lock_timeout_ms: u32,
    /// Recovery time after SET_ADDRESS
    pub set_address_delay_ms: u32,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            enumeration_timeout_ms: 1000,
            control_timeout_ms: 5000,
            lock_timeout_ms: LOCK_TIMEOUT_MS,
            set_address_delay_ms: 2,
        }
    }
}

/// Highest assignable device address
const ADDRESS_MAX: u8 = 127;

pub(crate) struct HostInner {
    lib: LibraryHandle,
    driver: Arc<dyn HostDriver>,
    options: HostOptions,
    /// Held around calls into the driver
    hw: TimedMutex<()>,
    /// Serializes enumeration; only one device answers at address zero
    enumeration: TimedMutex<()>,
    running: AtomicBool,
    suspended: AtomicBool,
    /// Bit `n` set when address `n` is taken; address zero is never handed out
    addresses: Mutex<u128>,
    devices: Mutex<Vec<Arc<DeviceEntry>>>,
}

impl HostInner {
    fn with_driver<R>(&self, func: impl FnOnce(&dyn HostDriver) -> Result<R>) -> Result<R> {
        let _guard = self
            .hw
            .lock(self.lib.os(), self.options.lock_timeout_ms)?;
        func(&*self.driver)
    }

    /// Map a transfer and hand it to the driver
    pub(crate) fn submit(&self, ep: &HostEndpoint, transfer: &Arc<Transfer>) -> Result<()> {
        self.submit_halting(ep, transfer, None)
    }

    /// Like [`submit()`](HostInner::submit) on an endpoint that can halt
    ///
    /// Fails with [`Error::Again`] while `halt` is raised. A STALL
    /// completion raises it.
    pub(crate) fn submit_halting(
        &self,
        ep: &HostEndpoint,
        transfer: &Arc<Transfer>,
        halt: Option<&HaltFlag>,
    ) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::NoInit);
        }
        if self.suspended.load(Ordering::Acquire) {
            return Err(Error::Again);
        }
        if halt.is_some_and(HaltFlag::is_set) {
            debug!(
                "dev {} EP{} halted",
                ep.device_address,
                ep.number()
            );
            return Err(Error::Again);
        }
        if transfer.is_in_progress() {
            return Err(Error::Busy);
        }
        transfer.check_iso(ep.descriptor.max_packet_size)?;
        transfer.begin_halting(self.lib.dma(), halt)?;
        let result = self.with_driver(|driver| driver.xfer_request(ep, transfer));
        if let Err(err) = result {
            warn!(
                "dev {} EP{} REQUEST {:?}",
                ep.device_address,
                ep.number(),
                err
            );
            transfer.abort(err);
        }
        result
    }

    /// Ask the driver to drop `transfer`, then complete it as cancelled
    pub(crate) fn cancel(&self, ep: &HostEndpoint, transfer: &Arc<Transfer>) -> Result<()> {
        if !transfer.is_in_progress() {
            return Ok(());
        }
        let result = self.with_driver(|driver| driver.xfer_cancel(ep, transfer));
        if !transfer.complete(Err(Error::Cancel)) {
            debug!(
                "dev {} EP{} completed before cancel",
                ep.device_address,
                ep.number()
            );
        }
        result
    }

    fn address_alloc(&self) -> Result<u8> {
        let mut addresses = self.addresses.lock();
        let address = (1..=ADDRESS_MAX)
            .find(|address| *addresses & (1 << address) == 0)
            .ok_or(Error::NoMem)?;
        *addresses |= 1 << address;
        Ok(address)
    }

    fn address_free(&self, address: u8) {
        let mut addresses = self.addresses.lock();
        if *addresses & (1 << address) == 0 {
            error!("address {} freed twice", address);
        }
        *addresses &= !(1u128 << address);
    }

    fn frame_number(&self) -> Result<u32> {
        self.with_driver(|driver| driver.frame_num_get())
    }

    /// Drop the device list's reference to every device on `port`
    fn detach(&self, port: Option<u8>) -> usize {
        let detached: Vec<_> = {
            let mut devices = self.devices.lock();
            let (gone, kept) = devices
                .drain(..)
                .partition(|entry| port.map_or(true, |port| entry.port == port));
            *devices = kept;
            gone
        };
        for entry in &detached {
            info!("DETACH dev {} port {}", entry.address, entry.port);
            entry.disconnect();
        }
        detached.len()
    }
}

/// A USB host controller
///
/// Cheap to clone; clones refer to the same controller.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub fn new(lib: &Library, driver: Arc<dyn HostDriver>, options: HostOptions) -> Result<Self> {
        let lib = lib.acquire()?;
        Ok(Self {
            inner: Arc::new(HostInner {
                lib,
                driver,
                options,
                hw: TimedMutex::new(()),
                enumeration: TimedMutex::new(()),
                running: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
                addresses: Mutex::new(1),
                devices: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Start the controller and its root hub
    ///
    /// Fails with [`Error::Perm`] if it's already running.
    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::Perm);
        }
        self.inner.with_driver(|driver| {
            driver.start()?;
            driver.rh_init()
        })?;
        self.inner.suspended.store(false, Ordering::Release);
        self.inner.running.store(true, Ordering::Release);
        info!("HOST START");
        Ok(())
    }

    /// Detach every device and stop the controller
    pub fn stop(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NoInit);
        }
        self.inner.detach(None);
        self.inner.running.store(false, Ordering::Release);
        self.inner.with_driver(|driver| driver.stop())?;
        info!("HOST STOP");
        Ok(())
    }

    pub fn suspend(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NoInit);
        }
        if self.inner.suspended.load(Ordering::Acquire) {
            return Err(Error::Perm);
        }
        self.inner.with_driver(|driver| driver.suspend())?;
        self.inner.suspended.store(true, Ordering::Release);
        debug!("HOST SUSPEND");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        if !self.inner.suspended.load(Ordering::Acquire) {
            return Err(Error::Perm);
        }
        self.inner.with_driver(|driver| driver.resume())?;
        self.inner.suspended.store(false, Ordering::Release);
        debug!("HOST RESUME");
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::Acquire)
    }

    /// The current (micro)frame number
    pub fn frame_number(&self) -> Result<u32> {
        self.inner.frame_number()
    }

    pub fn options(&self) -> &HostOptions {
        &self.inner.options
    }

    /// A device attached to `port`: enumerate and configure it
    ///
    /// Returns a handle to the configured device. On failure the device's
    /// address, if it got one, returns to the pool.
    pub fn port_connected(&self, port: u8, speed: Speed) -> Result<HostDevice> {
        if !self.is_running() {
            return Err(Error::NoInit);
        }
        let inner = &self.inner;
        let _guard = inner
            .enumeration
            .lock(inner.lib.os(), inner.options.lock_timeout_ms)?;
        if inner.devices.lock().iter().any(|entry| entry.port == port) {
            return Err(Error::Exist);
        }
        let entry = enumerate::enumerate(inner, port, speed)?;
        let handle = HostDevice::new(Arc::clone(&entry))?;
        inner.devices.lock().push(entry);
        Ok(handle)
    }

    /// The device on `port` went away
    ///
    /// Outstanding handles stay valid but their transfers fail with
    /// [`Error::NoDev`].
    pub fn port_disconnected(&self, port: u8) -> Result<()> {
        match self.inner.detach(Some(port)) {
            0 => Err(Error::NoDev),
            _ => Ok(()),
        }
    }

    /// Handles to every attached device, in attach order
    pub fn devices(&self) -> Vec<HostDevice> {
        let entries = self.inner.devices.lock().clone();
        entries
            .into_iter()
            .filter_map(|entry| HostDevice::new(entry).ok())
            .collect()
    }

    /// Take a handle to the device at `address`
    pub fn device_get(&self, address: u8) -> Result<HostDevice> {
        let entry = self
            .inner
            .devices
            .lock()
            .iter()
            .find(|entry| entry.address == address)
            .cloned()
            .ok_or(Error::NoDev)?;
        HostDevice::new(entry)
    }

    /// Returns `true` if `address` is assigned to a device, attached or not
    pub fn address_in_use(&self, address: u8) -> bool {
        address <= ADDRESS_MAX && *self.inner.addresses.lock() & (1 << address) != 0
    }
}
