//! Attached devices

use super::{control, HostConfig, HostEndpoint, HostInner, HostPipe};
use crate::descriptor::{descriptor_type, DeviceDescriptor};
use crate::error::{Error, Result};
use crate::os::TimedMutex;
use crate::pipe::Data;
use crate::refcnt::RefCount;
use crate::setup::SetupPacket;
use crate::transfer::HaltFlag;
use crate::{unicode, Speed, INTERFACE_NUM_MAX};
use alloc::{
    string::String,
    sync::{Arc, Weak},
};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;
use usb_device::control::Recipient;
use usb_device::endpoint::EndpointAddress;

/// Size of the buffer for string descriptor reads
const STRING_BUFFER: u16 = 255;

pub(crate) struct DeviceEntry {
    host: Weak<HostInner>,
    /// One reference for the device list, one per [`HostDevice`]
    refs: RefCount,
    connected: AtomicBool,
    pub(super) address: u8,
    pub(super) port: u8,
    speed: Speed,
    descriptor: DeviceDescriptor,
    ep0: HostEndpoint,
    config: HostConfig,
    alts: Mutex<[u8; INTERFACE_NUM_MAX]>,
    /// Endpoints that answered STALL; OUT endpoints in the low half
    halted: Arc<AtomicU32>,
    /// Serializes control transfers to the device
    control: TimedMutex<()>,
}

impl DeviceEntry {
    pub(super) fn new(
        host: &Arc<HostInner>,
        port: u8,
        ep0: HostEndpoint,
        descriptor: DeviceDescriptor,
        config: HostConfig,
    ) -> Self {
        Self {
            host: Arc::downgrade(host),
            refs: RefCount::new(),
            connected: AtomicBool::new(true),
            address: ep0.device_address,
            port,
            speed: ep0.speed,
            descriptor,
            ep0,
            config,
            alts: Mutex::new([0; INTERFACE_NUM_MAX]),
            halted: Arc::new(AtomicU32::new(0)),
            control: TimedMutex::new(()),
        }
    }

    pub(super) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Drop the device list's reference
    pub(super) fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.put();
        }
    }

    fn put(&self) {
        let released = self.refs.put(|| {
            if let Some(host) = self.host.upgrade() {
                host.address_free(self.address);
            }
        });
        if let Ok(true) = released {
            debug!("dev {} released", self.address);
        }
    }

    pub(super) fn halt_flag(&self, address: u8) -> HaltFlag {
        HaltFlag::new(Arc::clone(&self.halted), EndpointAddress::from(address))
    }

    pub(super) fn host(&self) -> Result<Arc<HostInner>> {
        if !self.is_connected() {
            return Err(Error::NoDev);
        }
        self.host.upgrade().ok_or(Error::NoDev)
    }
}

/// A counted handle to an attached device
///
/// Dropping the handle gives up its reference. Once the device is
/// disconnected, every operation fails with [`Error::NoDev`].
pub struct HostDevice {
    entry: Arc<DeviceEntry>,
}

impl HostDevice {
    /// Take a reference on `entry`
    pub(super) fn new(entry: Arc<DeviceEntry>) -> Result<Self> {
        if !entry.is_connected() {
            return Err(Error::NoDev);
        }
        entry.refs.get()?;
        Ok(Self { entry })
    }

    pub fn address(&self) -> u8 {
        self.entry.address
    }

    /// Root hub port the device is attached to
    pub fn port(&self) -> u8 {
        self.entry.port
    }

    pub fn speed(&self) -> Speed {
        self.entry.speed
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.entry.descriptor
    }

    /// The active configuration
    pub fn config(&self) -> &HostConfig {
        &self.entry.config
    }

    pub fn is_connected(&self) -> bool {
        self.entry.is_connected()
    }

    pub(crate) fn ep0(&self) -> HostEndpoint {
        self.entry.ep0
    }

    fn control(&self, setup: &SetupPacket, data: Data<'_>, timeout_ms: u32) -> Result<usize> {
        let host = self.entry.host()?;
        let _guard = self
            .entry
            .control
            .lock(host.lib.os(), host.options.lock_timeout_ms)?;
        control::run(&host, &self.entry.ep0, setup, data, timeout_ms)
    }

    /// Run a control transfer with an IN data stage, or none
    pub fn control_in(
        &self,
        setup: &SetupPacket,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize> {
        self.control(setup, Data::In(buf), timeout_ms)
    }

    /// Run a control transfer with an OUT data stage, or none
    pub fn control_out(
        &self,
        setup: &SetupPacket,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<usize> {
        self.control(setup, Data::Out(data), timeout_ms)
    }

    /// The host's bound on control transfers it issues itself
    pub(crate) fn control_timeout(&self) -> Result<u32> {
        Ok(self.entry.host()?.options.control_timeout_ms)
    }

    /// Ask the device for its active configuration value
    pub fn configuration(&self, timeout_ms: u32) -> Result<u8> {
        let mut value = [0];
        match self.control_in(&SetupPacket::get_configuration(), &mut value, timeout_ms)? {
            1 => Ok(value[0]),
            _ => Err(Error::Proto),
        }
    }

    /// Read string `index` in the device's first language
    pub fn string(&self, index: u8) -> Result<String> {
        if index == 0 {
            return Err(Error::Inval);
        }
        let timeout = self.control_timeout()?;
        let mut buf = [0; STRING_BUFFER as usize];
        let setup = SetupPacket::get_descriptor(descriptor_type::STRING, 0, 0, STRING_BUFFER);
        let n = self.control_in(&setup, &mut buf, timeout)?;
        if n < 4 {
            return Err(Error::Proto);
        }
        let lang_id = u16::from_le_bytes([buf[2], buf[3]]);

        let setup =
            SetupPacket::get_descriptor(descriptor_type::STRING, index, lang_id, STRING_BUFFER);
        let n = self.control_in(&setup, &mut buf, timeout)?;
        unicode::parse_string_descriptor(&buf[..n])
    }

    /// Select an alternate setting
    pub fn set_interface(&self, interface: u8, alt: u8) -> Result<()> {
        if usize::from(interface) >= INTERFACE_NUM_MAX {
            return Err(Error::Inval);
        }
        self.config()
            .interface(interface)
            .and_then(|i| i.alt(alt))
            .ok_or(Error::Inval)?;
        let timeout = self.control_timeout()?;
        self.control_out(&SetupPacket::set_interface(interface, alt), &[], timeout)?;
        self.entry.alts.lock()[usize::from(interface)] = alt;
        // Selecting a setting resets its endpoints
        if let Some(setting) = self.config().interface(interface).and_then(|i| i.alt(alt)) {
            for ep in &setting.endpoints {
                self.entry.halt_flag(ep.address).clear();
            }
        }
        debug!("dev {} interface {} alt {}", self.address(), interface, alt);
        Ok(())
    }

    /// The alternate setting selected for `interface`
    pub fn alt_setting(&self, interface: u8) -> Option<u8> {
        self.config().interface(interface)?;
        self.entry.alts.lock().get(usize::from(interface)).copied()
    }

    /// Clear the halt condition of endpoint `address` on the device
    ///
    /// Pipes on a halted endpoint refuse transfers with [`Error::Again`]
    /// until this succeeds.
    pub fn clear_halt(&self, address: u8) -> Result<()> {
        let timeout = self.control_timeout()?;
        self.control_out(&SetupPacket::clear_halt(address), &[], timeout)?;
        self.entry.halt_flag(address).clear();
        Ok(())
    }

    /// Whether a transfer on endpoint `address` stalled since the last clear
    pub fn is_halted(&self, address: u8) -> bool {
        self.entry.halt_flag(address).is_set()
    }

    pub fn status(&self, timeout_ms: u32) -> Result<u16> {
        let mut status = [0; 2];
        let setup = SetupPacket::get_status(Recipient::Device, 0);
        match self.control_in(&setup, &mut status, timeout_ms)? {
            2 => Ok(u16::from_le_bytes(status)),
            _ => Err(Error::Proto),
        }
    }

    /// Open a pipe on endpoint `address` of a selected alternate setting
    pub fn pipe_open(&self, address: u8) -> Result<HostPipe> {
        let host = self.entry.host()?;
        let descriptor = {
            let alts = self.entry.alts.lock();
            self.config()
                .endpoint(address, &*alts)
                .ok_or(Error::NoDev)?
        };
        let ep = HostEndpoint {
            device_address: self.address(),
            speed: self.speed(),
            descriptor,
        };
        host.with_driver(|driver| driver.ep_enable(&ep))?;
        debug!("dev {} PIPE {:x} open", self.address(), address);
        Ok(HostPipe::new(&host, Arc::clone(&self.entry), ep))
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        self.entry.put();
    }
}

#[cfg(test)]
mod tests {
    use crate::pipe::TransferPipe;
    use crate::testing::{self, HostEvent};
    use crate::Error;

    #[test]
    fn enumerated_device() {
        let fixture = testing::host();
        let device = fixture.attach();
        assert_eq!(device.address(), 1);
        assert_eq!(device.descriptor().id_vendor, testing::VID);
        assert_eq!(device.descriptor().id_product, testing::PID);
        assert_eq!(device.config().interfaces.len(), 3);
        assert_eq!(device.configuration(1000), Ok(1));
        assert_eq!(device.status(1000), Ok(0));
        assert_eq!(device.string(1).unwrap(), "usbstack");
        assert_eq!(device.string(0), Err(Error::Inval));
    }

    #[test]
    fn alternate_settings() {
        let fixture = testing::host();
        let device = fixture.attach();
        assert_eq!(device.alt_setting(1), Some(0));
        assert_eq!(device.alt_setting(5), None);
        assert_eq!(device.pipe_open(0x83).err(), Some(Error::NoDev));
        assert_eq!(device.set_interface(1, 7), Err(Error::Inval));

        device.set_interface(1, 1).unwrap();
        assert_eq!(device.alt_setting(1), Some(1));
        let pipe = device.pipe_open(0x83).unwrap();
        assert_eq!(u8::from(pipe.endpoint()), 0x83);
        assert!(fixture
            .driver
            .events()
            .contains(&HostEvent::EpEnable(device.address(), 0x83)));
        drop(pipe);
        assert!(fixture
            .driver
            .events()
            .contains(&HostEvent::EpDisable(device.address(), 0x83)));
    }

    #[test]
    fn clear_halt_goes_to_the_device() {
        let fixture = testing::host();
        let device = fixture.attach();
        device.clear_halt(0x81).unwrap();
        let setup = fixture.driver.last_setup(device.address()).unwrap();
        assert_eq!(setup.index, 0x81);
        assert_eq!(setup.request, usb_device::control::Request::CLEAR_FEATURE);
    }
}
