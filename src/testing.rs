//! Controller doubles shared by the unit tests

use crate::descriptor::{descriptor_type, DeviceDescriptor, EndpointDescriptor};
use crate::device::{Device, DeviceDriver, DeviceOptions, TypeSupport};
use crate::dma::{Coherent, DmaMapper};
use crate::host::{Host, HostDevice, HostDriver, HostEndpoint, HostOptions};
use crate::os::StdOs;
use crate::setup::SetupPacket;
use crate::transfer::{Transfer, TransferFlags};
use crate::{unicode, Error, Library, Result, Speed};
use alloc::{sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;
use std::{thread, time::Duration};
use usb_device::control::Request;
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

pub(crate) const VID: u16 = 0x1209;
pub(crate) const PID: u16 = 0x0001;

pub(crate) fn library() -> Library {
    Library::new(Arc::new(StdOs::new()), Arc::new(Coherent))
}

/// Coherent memory that still wants 32 byte DMA buffers, like a cached MCU
pub(crate) struct CacheLines;

impl DmaMapper for CacheLines {
    fn map(&self, buffer: &mut [u8], _: UsbDirection) -> Result<usize> {
        let addr = buffer.as_mut_ptr() as usize;
        if !buffer.is_empty() {
            assert_eq!(addr % 32, 0, "unaligned DMA buffer");
        }
        Ok(addr)
    }
    fn unmap(&self, _: usize, _: &mut [u8], _: UsbDirection) {}
    fn align(&self) -> usize {
        32
    }
}

/// Complete `transfer` from another thread, a little later
pub(crate) fn complete_later(transfer: Arc<Transfer>, result: Result<usize>) {
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(1));
        transfer.complete(result);
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceEvent {
    Run,
    Stop,
    Xfer(u8, usize),
    Cancel(u8),
    EpEnable(u8),
    EpDisable(u8),
    Halt(u8, bool),
    Ep0Stall,
    Address(u8),
    Config(u8),
    Pullup(bool),
}

/// Decides how the mock answers a transfer; `None` leaves it pending
pub(crate) type Responder = Arc<dyn Fn(&Transfer) -> Option<Result<usize>> + Send + Sync>;

/// Records every call, and keeps transfers pending until the test
/// completes them
#[derive(Default)]
pub(crate) struct MockDeviceDriver {
    events: Mutex<Vec<DeviceEvent>>,
    pending: Mutex<Vec<Arc<Transfer>>>,
    history: Mutex<Vec<Arc<Transfer>>>,
    responder: Mutex<Option<Responder>>,
    refused: Mutex<Vec<u8>>,
}

impl MockDeviceDriver {
    fn record(&self, event: DeviceEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }

    /// Number of transfers handed to the driver
    pub fn requests(&self) -> usize {
        self.history.lock().len()
    }

    pub fn stalls(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| **event == DeviceEvent::Ep0Stall)
            .count()
    }

    /// Remove the oldest pending transfer on `address`
    pub fn take(&self, address: u8) -> Option<Arc<Transfer>> {
        let mut pending = self.pending.lock();
        let index = pending
            .iter()
            .position(|transfer| u8::from(transfer.endpoint()) == address)?;
        Some(pending.remove(index))
    }

    /// The most recent transfer on `address`, pending or not
    pub fn last(&self, address: u8) -> Option<Arc<Transfer>> {
        self.history
            .lock()
            .iter()
            .rev()
            .find(|transfer| u8::from(transfer.endpoint()) == address)
            .cloned()
    }

    pub fn set_responder(
        &self,
        responder: impl Fn(&Transfer) -> Option<Result<usize>> + Send + Sync + 'static,
    ) {
        *self.responder.lock() = Some(Arc::new(responder));
    }

    /// Fail `ep_enable` for endpoint `address`
    pub fn refuse_enable(&self, address: u8) {
        self.refused.lock().push(address);
    }
}

impl DeviceDriver for MockDeviceDriver {
    fn run(&self) -> Result<()> {
        self.record(DeviceEvent::Run);
        Ok(())
    }
    fn stop(&self) -> Result<()> {
        self.record(DeviceEvent::Stop);
        Ok(())
    }
    fn xfer_request(&self, transfer: &Arc<Transfer>) -> Result<()> {
        self.record(DeviceEvent::Xfer(
            u8::from(transfer.endpoint()),
            transfer.length(),
        ));
        self.history.lock().push(Arc::clone(transfer));
        let responder = self.responder.lock().clone();
        match responder.and_then(|responder| responder(transfer)) {
            Some(result) => complete_later(Arc::clone(transfer), result),
            None => self.pending.lock().push(Arc::clone(transfer)),
        }
        Ok(())
    }
    fn xfer_cancel(&self, transfer: &Arc<Transfer>) -> Result<()> {
        self.record(DeviceEvent::Cancel(u8::from(transfer.endpoint())));
        self.pending
            .lock()
            .retain(|pending| !Arc::ptr_eq(pending, transfer));
        Ok(())
    }
    fn ep_enable(&self, desc: &EndpointDescriptor) -> Result<()> {
        if self.refused.lock().contains(&desc.address) {
            return Err(Error::NotSup);
        }
        self.record(DeviceEvent::EpEnable(desc.address));
        Ok(())
    }
    fn ep_disable(&self, address: EndpointAddress) -> Result<()> {
        self.record(DeviceEvent::EpDisable(u8::from(address)));
        Ok(())
    }
    fn ep_halt(&self, address: EndpointAddress, halt: bool) -> Result<()> {
        self.record(DeviceEvent::Halt(u8::from(address), halt));
        Ok(())
    }
    fn ep0_stall(&self) -> Result<()> {
        self.record(DeviceEvent::Ep0Stall);
        Ok(())
    }
    fn addr_set(&self, address: u8) -> Result<()> {
        self.record(DeviceEvent::Address(address));
        Ok(())
    }
    fn config_set(&self, value: u8) -> Result<()> {
        self.record(DeviceEvent::Config(value));
        Ok(())
    }
    fn pullup(&self, on: bool) -> Result<()> {
        self.record(DeviceEvent::Pullup(on));
        Ok(())
    }
}

pub(crate) struct DeviceFixture {
    pub device: Device,
    pub driver: Arc<MockDeviceDriver>,
}

impl DeviceFixture {
    /// Finish one control request that has no data stage
    pub fn no_data_request(&self, setup: SetupPacket) {
        self.device.setup_received(&setup.to_bytes()).unwrap();
        self.driver.take(0x80).unwrap().complete(Ok(0));
    }

    pub fn address_and_configure(&self, value: u8) {
        self.no_data_request(SetupPacket::set_address(1));
        self.no_data_request(SetupPacket::set_configuration(value));
    }
}

/// A device with three endpoint pairs and one empty configuration
pub(crate) fn device() -> DeviceFixture {
    let driver = Arc::new(MockDeviceDriver::default());
    let device = Device::new(
        &library(),
        driver.clone(),
        DeviceDescriptor {
            id_vendor: VID,
            id_product: PID,
            ..Default::default()
        },
        DeviceOptions::default(),
    )
    .unwrap();
    for number in 1..=3 {
        device
            .ep_register(0x80 | number, TypeSupport::all(), 512)
            .unwrap();
        device.ep_register(number, TypeSupport::all(), 512).unwrap();
    }
    device.add_config(None).unwrap();
    DeviceFixture { device, driver }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostEvent {
    Start,
    Stop,
    Suspend,
    Resume,
    /// (device address, endpoint address)
    EpEnable(u8, u8),
    EpDisable(u8, u8),
    /// (device address, endpoint address, length)
    Xfer(u8, u8, usize),
    Cancel(u8, u8),
}

/// How the emulated device misbehaves on one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Fail the SETUP stage
    Fail(Error),
    /// Never finish the SETUP stage
    Hang,
}

/// A device behind the mock root hub that answers standard requests
struct Emulated {
    address: u8,
    device: Vec<u8>,
    config: Vec<u8>,
    configuration: u8,
    setup: Option<SetupPacket>,
}

impl Emulated {
    fn answer(&self, setup: &SetupPacket) -> Option<Vec<u8>> {
        match setup.request {
            Request::GET_DESCRIPTOR => match setup.descriptor_type_index() {
                (descriptor_type::DEVICE, _) => Some(self.device.clone()),
                (descriptor_type::CONFIGURATION, 0) => Some(self.config.clone()),
                (descriptor_type::STRING, 0) => Some(unicode::langid_descriptor(&[0x0409])),
                (descriptor_type::STRING, 1) => unicode::string_descriptor(b"usbstack").ok(),
                _ => None,
            },
            Request::GET_CONFIGURATION => Some(vec![self.configuration]),
            Request::GET_STATUS => Some(vec![0, 0]),
            _ => None,
        }
    }

    /// The status stage of a request without a data stage finished
    fn apply(&mut self, setup: &SetupPacket) {
        match setup.request {
            Request::SET_ADDRESS => self.address = setup.value as u8,
            Request::SET_CONFIGURATION => self.configuration = setup.value as u8,
            _ => {}
        }
    }
}

/// A host controller with emulated devices on endpoint zero
///
/// Data endpoints behave like [`MockDeviceDriver`]: a responder decides,
/// or the transfer stays pending.
#[derive(Default)]
pub(crate) struct MockHostDriver {
    events: Mutex<Vec<HostEvent>>,
    stages: Mutex<Vec<u8>>,
    setups: Mutex<Vec<(u8, SetupPacket)>>,
    devices: Mutex<Vec<Emulated>>,
    faults: Mutex<Vec<(u8, Fault)>>,
    pending: Mutex<Vec<Arc<Transfer>>>,
    responder: Mutex<Option<Responder>>,
    cancel_fault: Mutex<Option<Error>>,
    frame: AtomicU32,
}

impl MockHostDriver {
    fn record(&self, event: HostEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
        self.stages.lock().clear();
    }

    /// Endpoint addresses of the control stages since the last clear
    pub fn control_stages(&self) -> Vec<u8> {
        self.stages.lock().clone()
    }

    /// Every SETUP packet, with the device address it went to
    pub fn setups(&self) -> Vec<(u8, SetupPacket)> {
        self.setups.lock().clone()
    }

    pub fn last_setup(&self, address: u8) -> Option<SetupPacket> {
        self.setups
            .lock()
            .iter()
            .rev()
            .find(|(to, _)| *to == address)
            .map(|(_, setup)| *setup)
    }

    pub fn set_fault(&self, request: u8, fault: Fault) {
        self.faults.lock().push((request, fault));
    }

    /// Attach a fresh device that answers at address zero
    pub fn plug(&self) {
        self.plug_with(emulated_device(64), emulated_config());
    }

    pub fn plug_with(&self, device: Vec<u8>, config: Vec<u8>) {
        self.devices.lock().push(Emulated {
            address: 0,
            device,
            config,
            configuration: 0,
            setup: None,
        });
    }

    /// Fail every later `xfer_cancel` with `err`
    pub fn set_cancel_fault(&self, err: Error) {
        *self.cancel_fault.lock() = Some(err);
    }

    pub fn set_frame(&self, frame: u32) {
        self.frame.store(frame, Ordering::Release);
    }

    /// Remove the oldest pending transfer on endpoint `address`
    pub fn take(&self, address: u8) -> Option<Arc<Transfer>> {
        let mut pending = self.pending.lock();
        let index = pending
            .iter()
            .position(|transfer| u8::from(transfer.endpoint()) == address)?;
        Some(pending.remove(index))
    }

    pub fn set_responder(
        &self,
        responder: impl Fn(&Transfer) -> Option<Result<usize>> + Send + Sync + 'static,
    ) {
        *self.responder.lock() = Some(Arc::new(responder));
    }

    /// Run one control stage against the emulated device at `address`
    fn control_stage(&self, address: u8, transfer: &Transfer) -> Option<Result<usize>> {
        let mut devices = self.devices.lock();
        // The latest device plugged in wins an address
        let Some(device) = devices
            .iter_mut()
            .rev()
            .find(|device| device.address == address)
        else {
            return Some(Err(Error::Proto));
        };
        if transfer.flags().contains(TransferFlags::SETUP) {
            let setup = match transfer.with_buffer(|buf| SetupPacket::from_bytes(buf)) {
                Ok(setup) => setup,
                Err(err) => return Some(Err(err)),
            };
            self.setups.lock().push((address, setup));
            device.setup = Some(setup);
            let fault = self
                .faults
                .lock()
                .iter()
                .find(|(request, _)| *request == setup.request)
                .map(|(_, fault)| *fault);
            return match fault {
                Some(Fault::Hang) => None,
                Some(Fault::Fail(err)) => Some(Err(err)),
                None => Some(Ok(SetupPacket::LEN)),
            };
        }
        let Some(setup) = device.setup else {
            return Some(Err(Error::Proto));
        };
        if transfer.length() == 0 {
            device.apply(&setup);
            return Some(Ok(0));
        }
        if transfer.direction() == UsbDirection::Out {
            return Some(Ok(transfer.length()));
        }
        match device.answer(&setup) {
            Some(data) => {
                let n = data.len().min(transfer.length());
                transfer.with_buffer(|buf| buf[..n].copy_from_slice(&data[..n]));
                Some(Ok(n))
            }
            // STALL
            None => Some(Err(Error::Again)),
        }
    }
}

impl HostDriver for MockHostDriver {
    fn start(&self) -> Result<()> {
        self.record(HostEvent::Start);
        Ok(())
    }
    fn stop(&self) -> Result<()> {
        self.record(HostEvent::Stop);
        Ok(())
    }
    fn suspend(&self) -> Result<()> {
        self.record(HostEvent::Suspend);
        Ok(())
    }
    fn resume(&self) -> Result<()> {
        self.record(HostEvent::Resume);
        Ok(())
    }
    fn ep_enable(&self, ep: &HostEndpoint) -> Result<()> {
        self.record(HostEvent::EpEnable(ep.device_address, ep.descriptor.address));
        Ok(())
    }
    fn ep_disable(&self, ep: &HostEndpoint) -> Result<()> {
        self.record(HostEvent::EpDisable(ep.device_address, ep.descriptor.address));
        Ok(())
    }
    fn xfer_request(&self, ep: &HostEndpoint, transfer: &Arc<Transfer>) -> Result<()> {
        let endpoint = u8::from(transfer.endpoint());
        self.record(HostEvent::Xfer(ep.device_address, endpoint, transfer.length()));
        let result = if ep.number() == 0 {
            self.stages.lock().push(endpoint);
            self.control_stage(ep.device_address, transfer)
        } else {
            let responder = self.responder.lock().clone();
            responder.and_then(|responder| responder(transfer))
        };
        match result {
            Some(result) => complete_later(Arc::clone(transfer), result),
            None => self.pending.lock().push(Arc::clone(transfer)),
        }
        Ok(())
    }
    fn xfer_cancel(&self, ep: &HostEndpoint, transfer: &Arc<Transfer>) -> Result<()> {
        self.record(HostEvent::Cancel(
            ep.device_address,
            u8::from(transfer.endpoint()),
        ));
        self.pending
            .lock()
            .retain(|pending| !Arc::ptr_eq(pending, transfer));
        match *self.cancel_fault.lock() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
    fn frame_num_get(&self) -> Result<u32> {
        Ok(self.frame.load(Ordering::Acquire))
    }
}

/// Device descriptor of the emulated device
pub(crate) fn emulated_device(max_packet_size0: u8) -> Vec<u8> {
    DeviceDescriptor {
        id_vendor: VID,
        id_product: PID,
        max_packet_size0,
        product: 1,
        num_configurations: 1,
        ..Default::default()
    }
    .to_bytes()
    .to_vec()
}

/// One configuration: a vendor interface with a bulk pair, then two audio
/// streaming interfaces. Alternate setting 1 of interface 1 has a 44.1 kHz
/// stereo 16 bit isochronous IN endpoint; the one of interface 2 an adaptive
/// isochronous OUT endpoint at 32 or 48 kHz.
pub(crate) fn emulated_config() -> Vec<u8> {
    let mut config = vec![9, descriptor_type::CONFIGURATION, 0, 0, 3, 1, 0, 0x80, 50];
    config.extend_from_slice(&[9, descriptor_type::INTERFACE, 0, 0, 2, 0xFF, 0, 0, 0]);
    config.extend_from_slice(&[7, descriptor_type::ENDPOINT, 0x81, 0x02, 0x00, 0x02, 0]);
    config.extend_from_slice(&[7, descriptor_type::ENDPOINT, 0x02, 0x02, 0x00, 0x02, 0]);
    config.extend_from_slice(&[9, descriptor_type::INTERFACE, 1, 0, 0, 0x01, 0x02, 0, 0]);
    config.extend_from_slice(&[9, descriptor_type::INTERFACE, 1, 1, 1, 0x01, 0x02, 0, 0]);
    // AS general, PCM
    config.extend_from_slice(&[7, descriptor_type::CS_INTERFACE, 0x01, 1, 1, 0x01, 0x00]);
    // Type I format: 2 channels, 2 byte subframes, 16 bits, 44100 Hz
    config.extend_from_slice(&[
        11,
        descriptor_type::CS_INTERFACE,
        0x02,
        0x01,
        2,
        2,
        16,
        1,
        0x44,
        0xAC,
        0x00,
    ]);
    config.extend_from_slice(&[7, descriptor_type::ENDPOINT, 0x83, 0x05, 192, 0, 1]);
    config.extend_from_slice(&[7, descriptor_type::CS_ENDPOINT, 0x01, 0, 0, 0, 0]);
    config.extend_from_slice(&[9, descriptor_type::INTERFACE, 2, 0, 0, 0x01, 0x02, 0, 0]);
    config.extend_from_slice(&[9, descriptor_type::INTERFACE, 2, 1, 1, 0x01, 0x02, 0, 0]);
    config.extend_from_slice(&[7, descriptor_type::CS_INTERFACE, 0x01, 2, 1, 0x01, 0x00]);
    // Type I format: 2 channels, 2 byte subframes, 16 bits, 32 or 48 kHz
    config.extend_from_slice(&[
        14,
        descriptor_type::CS_INTERFACE,
        0x02,
        0x01,
        2,
        2,
        16,
        2,
        0x00,
        0x7D,
        0x00,
        0x80,
        0xBB,
        0x00,
    ]);
    config.extend_from_slice(&[7, descriptor_type::ENDPOINT, 0x04, 0x09, 200, 0, 1]);
    config.extend_from_slice(&[7, descriptor_type::CS_ENDPOINT, 0x01, 0, 0, 0, 0]);
    let total = config.len() as u16;
    config[2..4].copy_from_slice(&total.to_le_bytes());
    config
}

pub(crate) struct HostFixture {
    pub host: Host,
    pub driver: Arc<MockHostDriver>,
}

impl HostFixture {
    /// Plug an emulated device into `port` and enumerate it at high speed
    pub fn attach_on(&self, port: u8) -> HostDevice {
        self.driver.plug();
        self.host.port_connected(port, Speed::High).unwrap()
    }

    pub fn attach(&self) -> HostDevice {
        self.attach_on(0)
    }
}

/// A running host with no devices attached
pub(crate) fn host() -> HostFixture {
    host_with(&library())
}

pub(crate) fn host_with(lib: &Library) -> HostFixture {
    let driver = Arc::new(MockHostDriver::default());
    let host = Host::new(lib, driver.clone(), HostOptions::default()).unwrap();
    host.start().unwrap();
    HostFixture { host, driver }
}
