//! Device (peripheral) stack
//!
//! A [`Device`] owns the configurations, the hardware endpoints, and the
//! endpoint zero state machine of one device controller. Build the
//! configurations first, then [`run()`](Device::run). Once running, the
//! topology is frozen; only transfers move.
//!
//! The controller driver feeds events into the device:
//!
//! - [`bus_reset()`](Device::bus_reset) after a USB reset,
//! - [`setup_received()`](Device::setup_received) for each SETUP packet,
//! - [`suspend()`](Device::suspend) and [`resume()`](Device::resume).

mod config;
mod control;
mod driver;
mod endpoint;
mod function;
pub mod strings;

pub use config::{AssociationInfo, ConfigId, InterfaceInfo, PipeInfo};
pub use driver::DeviceDriver;
pub use endpoint::TypeSupport;
pub use function::{ControlReply, FunctionOps, OutHandler, StatusHook};

use crate::descriptor::{
    descriptor_type, DeviceDescriptor, InterfaceAssociationDescriptor, InterfaceDescriptor,
};
use crate::error::{Error, Result};
use crate::os::{Os, TimedMutex};
use crate::pipe::TransferPipe;
use crate::transfer::{Transfer, TransferType};
use crate::{
    Library, LibraryHandle, Speed, CONFIG_NUM_MAX, EP0_BUFFER_SIZE, INTERFACE_NUM_MAX,
    LOCK_TIMEOUT_MS,
};
use alloc::{
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
use config::Config;
use control::Stage;
use core::sync::atomic::{AtomicBool, Ordering};
use endpoint::EndpointRegistry;
use spin::{Mutex, RwLock};
use strings::StringTable;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// Run time device options
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Size of the endpoint zero buffers; every configuration must fit
    pub ep0_buffer_size: usize,
    /// Fastest speed the controller supports
    pub speed: Speed,
    /// Language of the string descriptors
    pub lang_id: u16,
    /// Bound on acquiring the controller lock, in milliseconds
    pub lock_timeout_ms: u32,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            ep0_buffer_size: EP0_BUFFER_SIZE,
            speed: Speed::High,
            lang_id: 0x0409,
            lock_timeout_ms: LOCK_TIMEOUT_MS,
        }
    }
}

/// USB device states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum DeviceState {
    /// Reset, answering at address zero
    Default,
    /// Addressed, not configured
    Address,
    Configured,
    Suspended,
}

struct BusState {
    state: DeviceState,
    /// State to return to on resume
    before_suspend: DeviceState,
    address: u8,
    speed: Speed,
    /// Index of the active configuration
    config: Option<usize>,
    alts: [u8; INTERFACE_NUM_MAX],
    remote_wakeup: bool,
}

impl BusState {
    fn new() -> Self {
        Self {
            state: DeviceState::Default,
            before_suspend: DeviceState::Default,
            address: 0,
            speed: Speed::Full,
            config: None,
            alts: [0; INTERFACE_NUM_MAX],
            remote_wakeup: false,
        }
    }
}

/// Everything that's fixed once the device runs
struct Topology {
    registry: EndpointRegistry,
    configs: Vec<Config>,
    strings: StringTable,
    bos: Option<Vec<u8>>,
    vendor: Option<Arc<dyn FunctionOps>>,
}

pub(crate) struct DeviceInner {
    lib: LibraryHandle,
    driver: Arc<dyn DeviceDriver>,
    options: DeviceOptions,
    descriptor: DeviceDescriptor,
    /// Held around calls into the driver
    hw: TimedMutex<()>,
    topology: RwLock<Topology>,
    bus: Mutex<BusState>,
    control: Mutex<Stage>,
    ep0_in: Arc<Transfer>,
    ep0_out: Arc<Transfer>,
    running: AtomicBool,
}

/// A USB device
///
/// Cheap to clone; clones refer to the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Create a device on top of a controller driver
    pub fn new(
        lib: &Library,
        driver: Arc<dyn DeviceDriver>,
        descriptor: DeviceDescriptor,
        options: DeviceOptions,
    ) -> Result<Self> {
        let lib = lib.acquire()?;
        let align = lib.dma().align();
        let inner = Arc::new_cyclic(|weak: &Weak<DeviceInner>| {
            let ep0 = |direction| {
                let weak = Weak::clone(weak);
                Transfer::builder(
                    EndpointAddress::from_parts(0, direction),
                    TransferType::Control,
                )
                .capacity(options.ep0_buffer_size)
                .align(align)
                .callback(move |transfer| {
                    if let Some(device) = weak.upgrade() {
                        device.ep0_complete(transfer);
                    }
                })
                .build()
            };
            DeviceInner {
                ep0_in: ep0(UsbDirection::In),
                ep0_out: ep0(UsbDirection::Out),
                lib,
                driver,
                descriptor,
                hw: TimedMutex::new(()),
                topology: RwLock::new(Topology {
                    registry: EndpointRegistry::default(),
                    configs: Vec::new(),
                    strings: StringTable::new(options.lang_id),
                    bos: None,
                    vendor: None,
                }),
                bus: Mutex::new(BusState::new()),
                control: Mutex::new(Stage::Idle),
                running: AtomicBool::new(false),
                options,
            }
        });
        Ok(Self { inner })
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Lock the topology for a build-time change
    fn build(&self) -> Result<spin::RwLockWriteGuard<'_, Topology>> {
        if self.is_running() {
            return Err(Error::Perm);
        }
        Ok(self.inner.topology.write())
    }

    /// Register a hardware endpoint
    ///
    /// Registration order decides which endpoints automatic pipe allocation
    /// hands out first.
    pub fn ep_register(&self, address: u8, types: TypeSupport, mps_limit: u16) -> Result<()> {
        self.build()?
            .registry
            .register(EndpointAddress::from(address), types, mps_limit)
    }

    pub fn set_manufacturer(&self, text: &str) -> Result<()> {
        self.build()?.strings.set(strings::MANUFACTURER, text)
    }

    pub fn set_product(&self, text: &str) -> Result<()> {
        self.build()?.strings.set(strings::PRODUCT, text)
    }

    pub fn set_serial_number(&self, text: &str) -> Result<()> {
        self.build()?.strings.set(strings::SERIAL_NUMBER, text)
    }

    /// Store a prebuilt string descriptor at `index`
    pub fn set_string_descriptor(&self, index: u8, desc: Vec<u8>) -> Result<()> {
        self.build()?.strings.set_raw(index, desc)
    }

    /// Answer GET_DESCRIPTOR(BOS) with `bos`
    pub fn set_bos(&self, bos: Vec<u8>) -> Result<()> {
        self.build()?.bos = Some(bos);
        Ok(())
    }

    /// Handle vendor requests addressed to the device
    pub fn set_vendor_handler(&self, handler: Arc<dyn FunctionOps>) -> Result<()> {
        self.build()?.vendor = Some(handler);
        Ok(())
    }

    /// Add a configuration, optionally named
    pub fn add_config(&self, name: Option<&str>) -> Result<ConfigId> {
        let mut topology = self.build()?;
        if topology.configs.len() >= CONFIG_NUM_MAX {
            return Err(Error::NoMem);
        }
        let name = match name {
            Some(text) => topology.strings.alloc(text)?,
            None => 0,
        };
        let value = topology.configs.len() as u8 + 1;
        topology.configs.push(Config::new(value, name));
        debug!("CONFIG {}", value);
        Ok(ConfigId(value))
    }

    /// Set `bmAttributes` and `bMaxPower` (2 mA units) of a configuration
    pub fn set_config_attributes(
        &self,
        config: ConfigId,
        attributes: u8,
        max_power: u8,
    ) -> Result<()> {
        let mut topology = self.build()?;
        let config = config_mut(&mut topology, config)?;
        config.attributes = attributes;
        config.max_power = max_power;
        Ok(())
    }

    /// Add one alternate setting of one interface
    pub fn add_function(
        &self,
        config: ConfigId,
        info: InterfaceInfo,
        ops: Arc<dyn FunctionOps>,
    ) -> Result<()> {
        let limit = self.inner.options.ep0_buffer_size;
        let mut topology = self.build()?;
        let desc = interface_descriptor(&mut topology.strings, &info)?;
        config_mut(&mut topology, config)?.add_function(desc, info.class_descriptors, ops, limit)
    }

    /// Add a group of interfaces behind an interface association
    ///
    /// The interfaces take the numbers `iad.first_interface` onwards, which
    /// must all be free. Their `number` fields are ignored. Either every
    /// interface is added or none is.
    pub fn add_function_association(
        &self,
        config: ConfigId,
        iad: AssociationInfo,
        functions: Vec<(InterfaceInfo, Arc<dyn FunctionOps>)>,
    ) -> Result<()> {
        let limit = self.inner.options.ep0_buffer_size;
        let mut topology = self.build()?;
        let function = match &iad.name {
            Some(text) => topology.strings.alloc(text)?,
            None => 0,
        };
        let mut group = Vec::with_capacity(functions.len());
        for (info, ops) in functions {
            let desc = interface_descriptor(&mut topology.strings, &info)?;
            group.push((desc, info.class_descriptors, ops));
        }
        let iad = InterfaceAssociationDescriptor {
            first_interface: iad.first_interface,
            interface_count: group.len() as u8,
            function_class: iad.class,
            function_subclass: iad.subclass,
            function_protocol: iad.protocol,
            function,
        };
        config_mut(&mut topology, config)?.add_association(iad, group, limit)
    }

    /// Add a pipe to an alternate setting, and return its endpoint address
    pub fn add_pipe(
        &self,
        config: ConfigId,
        interface: u8,
        alt: u8,
        pipe: PipeInfo,
    ) -> Result<EndpointAddress> {
        let limit = self.inner.options.ep0_buffer_size;
        let mut topology = self.build()?;
        let Topology {
            registry, configs, ..
        } = &mut *topology;
        let config = configs
            .iter_mut()
            .find(|c| c.value == config.0)
            .ok_or(Error::NoDev)?;
        config.add_pipe(registry, interface, alt, pipe, limit)
    }

    /// Returns a handle for moving data on `address`
    pub fn pipe(&self, address: EndpointAddress) -> Result<DevicePipe> {
        let topology = self.inner.topology.read();
        let ep = topology.registry.get(address).ok_or(Error::NoDev)?;
        Ok(DevicePipe {
            device: Arc::downgrade(&self.inner),
            lib: (*self.inner.lib).clone(),
            endpoint: address,
            kind: ep.kind(),
            sync: Arc::clone(&ep.sync),
            lock_timeout: self.inner.options.lock_timeout_ms,
        })
    }

    /// Serialize a configuration as the host would read it now
    pub fn config_descriptor(&self, config: ConfigId) -> Result<Vec<u8>> {
        let speed = self.speed();
        let topology = self.inner.topology.read();
        let config = topology
            .configs
            .iter()
            .find(|c| c.value == config.0)
            .ok_or(Error::NoDev)?;
        let mut buf = vec![0; config.total_len()];
        let len = config.serialize(&mut buf, descriptor_type::CONFIGURATION, speed)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Start the controller and connect to the bus
    ///
    /// Fails with [`Error::Perm`] if the device already runs, and with
    /// [`Error::NoInit`] if there's no configuration.
    pub fn run(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::Perm);
        }
        if self.inner.topology.read().configs.is_empty() {
            return Err(Error::NoInit);
        }
        self.inner.with_driver(|driver| {
            driver.reset()?;
            driver.run()?;
            driver.pullup(true)
        })?;
        self.inner.running.store(true, Ordering::Release);
        debug!("RUN");
        Ok(())
    }

    /// Disconnect and stop the controller
    pub fn stop(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Perm);
        }
        self.inner.with_driver(|driver| {
            driver.pullup(false)?;
            driver.stop()
        })?;
        self.inner.control_abort();
        self.inner.deconfigure(true);
        *self.inner.bus.lock() = BusState::new();
        self.inner.running.store(false, Ordering::Release);
        debug!("STOP");
        Ok(())
    }

    /// The driver saw a bus reset and negotiated `speed`
    pub fn bus_reset(&self, speed: Speed) {
        self.inner.control_abort();
        self.inner.deconfigure(false);
        self.inner.topology.read().registry.reset();
        let mut bus = self.inner.bus.lock();
        *bus = BusState::new();
        bus.speed = speed;
        debug!("RESET {:?}", speed);
    }

    /// The driver received a SETUP packet on endpoint zero
    ///
    /// On error, endpoint zero is already stalled.
    pub fn setup_received(&self, setup: &[u8]) -> Result<()> {
        self.inner.setup_received(setup)
    }

    pub fn suspend(&self) {
        let mut bus = self.inner.bus.lock();
        if bus.state != DeviceState::Suspended {
            bus.before_suspend = bus.state;
            bus.state = DeviceState::Suspended;
            debug!("SUSPEND");
        }
    }

    pub fn resume(&self) {
        let mut bus = self.inner.bus.lock();
        if bus.state == DeviceState::Suspended {
            bus.state = bus.before_suspend;
            debug!("RESUME");
        }
    }

    /// Wake the host, if it allowed remote wakeup
    pub fn remote_wakeup(&self) -> Result<()> {
        {
            let bus = self.inner.bus.lock();
            if bus.state != DeviceState::Suspended || !bus.remote_wakeup {
                return Err(Error::Perm);
            }
        }
        self.inner.with_driver(|driver| driver.wakeup())
    }

    pub fn state(&self) -> DeviceState {
        self.inner.bus.lock().state
    }

    pub fn address(&self) -> u8 {
        self.inner.bus.lock().address
    }

    pub fn speed(&self) -> Speed {
        self.inner.bus.lock().speed
    }

    /// Returns the active `bConfigurationValue`, or zero
    pub fn configuration(&self) -> u8 {
        self.inner.configuration_value()
    }

    /// Returns the current alternate setting of `interface`
    pub fn alt_setting(&self, interface: u8) -> Option<u8> {
        let bus = self.inner.bus.lock();
        bus.config?;
        bus.alts.get(usize::from(interface)).copied()
    }
}

fn config_mut(topology: &mut Topology, config: ConfigId) -> Result<&mut Config> {
    topology
        .configs
        .iter_mut()
        .find(|c| c.value == config.0)
        .ok_or(Error::NoDev)
}

fn interface_descriptor(
    strings: &mut StringTable,
    info: &InterfaceInfo,
) -> Result<InterfaceDescriptor> {
    let interface = match &info.name {
        Some(text) => strings.alloc(text)?,
        None => 0,
    };
    Ok(InterfaceDescriptor {
        interface_number: info.number,
        alternate_setting: info.alt,
        num_endpoints: 0,
        interface_class: info.class,
        interface_subclass: info.subclass,
        interface_protocol: info.protocol,
        interface,
    })
}

impl DeviceInner {
    /// Call into the driver under the controller lock
    fn with_driver<R>(&self, func: impl FnOnce(&dyn DeviceDriver) -> Result<R>) -> Result<R> {
        let _guard = self
            .hw
            .lock(self.lib.os(), self.options.lock_timeout_ms)?;
        func(&*self.driver)
    }

    fn configuration_value(&self) -> u8 {
        let index = self.bus.lock().config;
        index
            .and_then(|index| self.topology.read().configs.get(index).map(|c| c.value))
            .unwrap_or(0)
    }

    /// Map a transfer and hand it to the driver
    fn start(&self, transfer: &Arc<Transfer>) -> Result<()> {
        transfer.begin(self.lib.dma())?;
        let result = self.with_driver(|driver| driver.xfer_request(transfer));
        if let Err(err) = result {
            warn!(
                "EP{} {:?} REQUEST {:?}",
                transfer.endpoint().index(),
                transfer.direction(),
                err
            );
            transfer.abort(err);
        }
        result
    }

    /// Submit a transfer on a data endpoint
    fn submit(&self, transfer: &Arc<Transfer>) -> Result<()> {
        let address = transfer.endpoint();
        if address.index() == 0 {
            return Err(Error::Inval);
        }
        {
            let topology = self.topology.read();
            let ep = topology.registry.get(address).ok_or(Error::NoDev)?;
            if transfer.is_in_progress() {
                return Err(Error::Busy);
            }
            if !ep.is_enabled() {
                return Err(Error::NoDev);
            }
            transfer.check_iso(ep.mps())?;
            if ep.is_stalled() {
                return Err(Error::Again);
            }
        }
        self.start(transfer)
    }

    /// Ask the driver to drop `transfer`, then complete it as cancelled
    fn cancel(&self, transfer: &Arc<Transfer>) -> Result<()> {
        if !transfer.is_in_progress() {
            return Ok(());
        }
        let result = self.with_driver(|driver| driver.xfer_cancel(transfer));
        if !transfer.complete(Err(Error::Cancel)) {
            debug!("EP{} completed before cancel", transfer.endpoint().index());
        }
        result
    }

    fn set_halt(&self, address: EndpointAddress, halt: bool) -> Result<()> {
        {
            let topology = self.topology.read();
            let ep = topology.registry.get(address).ok_or(Error::NoDev)?;
            ep.set_stalled(halt);
        }
        self.with_driver(|driver| {
            driver.ep_halt(address, halt)?;
            if !halt {
                driver.ep_reset(address)?;
            }
            Ok(())
        })
    }

    fn is_halted(&self, address: EndpointAddress) -> Result<bool> {
        let topology = self.topology.read();
        let ep = topology.registry.get(address).ok_or(Error::NoDev)?;
        Ok(ep.is_stalled())
    }

    /// Enable the endpoints of one alternate setting
    fn enable_alt(&self, topology: &Topology, endpoints: &[config::AltEndpoint]) -> Result<()> {
        let speed = self.bus.lock().speed;
        for ep in endpoints {
            let desc = config::clamp(ep.desc, speed);
            if let Some(hw) = topology.registry.get(desc.endpoint_address()) {
                hw.select(desc.transfer_type(), desc.max_packet_size);
                self.with_driver(|driver| driver.ep_enable(&desc))?;
                hw.set_stalled(false);
                hw.set_enabled(true);
            }
        }
        Ok(())
    }

    /// Disable the endpoints of one alternate setting
    fn disable_alt(&self, topology: &Topology, endpoints: &[config::AltEndpoint], hardware: bool) {
        for ep in endpoints {
            let address = ep.desc.endpoint_address();
            if let Some(hw) = topology.registry.get(address) {
                hw.set_enabled(false);
            }
            if hardware {
                if let Err(err) = self.with_driver(|driver| driver.ep_disable(address)) {
                    warn!("EP{} DISABLE {:?}", address.index(), err);
                }
            }
        }
    }

    /// Leave the active configuration, if any
    ///
    /// `hardware` selects whether the driver disables the endpoints; after a
    /// bus reset they're already off.
    fn deconfigure(&self, hardware: bool) {
        let (index, alts) = {
            let mut bus = self.bus.lock();
            let alts = bus.alts;
            bus.alts = [0; INTERFACE_NUM_MAX];
            (bus.config.take(), alts)
        };
        let Some(index) = index else {
            return;
        };
        let mut functions = Vec::new();
        {
            let topology = self.topology.read();
            if let Some(config) = topology.configs.get(index) {
                for func in &config.functions {
                    let alt = alts[usize::from(func.number)];
                    if let Some(setting) = func.alt(alt) {
                        self.disable_alt(&topology, &setting.endpoints, hardware);
                        functions.push((func.number, Arc::clone(&setting.ops)));
                    }
                }
            }
        }
        for (number, ops) in functions {
            ops.disable(number);
        }
        debug!("DECONFIGURED");
    }

    /// Activate configuration `value`, or none for zero
    fn set_configuration(&self, value: u8) -> Result<()> {
        let index = if value == 0 {
            None
        } else {
            let topology = self.topology.read();
            let index = topology.configs.iter().position(|c| c.value == value);
            Some(index.ok_or(Error::Inval)?)
        };
        match self.bus.lock().state {
            DeviceState::Address | DeviceState::Configured => {}
            _ => return Err(Error::Perm),
        }

        self.deconfigure(true);
        self.with_driver(|driver| driver.config_set(value))?;

        let Some(index) = index else {
            self.bus.lock().state = DeviceState::Address;
            return Ok(());
        };
        let mut functions = Vec::new();
        {
            let topology = self.topology.read();
            let config = topology.configs.get(index).ok_or(Error::Inval)?;
            for (position, func) in config.functions.iter().enumerate() {
                let Some(setting) = func.alt(0) else {
                    continue;
                };
                if let Err(err) = self.enable_alt(&topology, &setting.endpoints) {
                    warn!("CONFIGURE {} failed: {:?}", value, err);
                    for func in &config.functions[..=position] {
                        if let Some(setting) = func.alt(0) {
                            self.disable_alt(&topology, &setting.endpoints, true);
                        }
                    }
                    if let Err(err) = self.with_driver(|driver| driver.config_set(0)) {
                        warn!("CONFIGURE 0 failed: {:?}", err);
                    }
                    self.bus.lock().state = DeviceState::Address;
                    return Err(err);
                }
                functions.push((func.number, Arc::clone(&setting.ops)));
            }
        }
        {
            let mut bus = self.bus.lock();
            bus.config = Some(index);
            bus.alts = [0; INTERFACE_NUM_MAX];
            bus.state = DeviceState::Configured;
        }
        debug!("CONFIGURED {}", value);
        for (number, ops) in functions {
            ops.alt_set(number, 0)?;
        }
        Ok(())
    }

    /// Switch `interface` to alternate setting `alt`
    fn set_interface(&self, interface: u8, alt: u8) -> Result<()> {
        let (index, current) = {
            let bus = self.bus.lock();
            let index = bus.config.ok_or(Error::Inval)?;
            let current = *bus.alts.get(usize::from(interface)).ok_or(Error::Inval)?;
            (index, current)
        };
        let ops = {
            let topology = self.topology.read();
            let func = topology
                .configs
                .get(index)
                .and_then(|config| config.function(interface))
                .ok_or(Error::NoDev)?;
            let next = func.alt(alt).ok_or(Error::Inval)?;
            if let Some(previous) = func.alt(current) {
                self.disable_alt(&topology, &previous.endpoints, true);
            }
            self.enable_alt(&topology, &next.endpoints)?;
            Arc::clone(&next.ops)
        };
        self.bus.lock().alts[usize::from(interface)] = alt;
        debug!("INTERFACE {} ALT {}", interface, alt);
        ops.alt_set(interface, alt)
    }

    /// Returns the callbacks of the active alternate setting of `interface`
    fn interface_ops(&self, interface: u8) -> Option<(Arc<dyn FunctionOps>, u8)> {
        let (index, alt) = {
            let bus = self.bus.lock();
            (bus.config?, *bus.alts.get(usize::from(interface))?)
        };
        let topology = self.topology.read();
        let setting = topology.configs.get(index)?.function(interface)?.alt(alt)?;
        Some((Arc::clone(&setting.ops), alt))
    }

    /// Returns the interface that owns `address` in the active configuration
    fn endpoint_owner(&self, address: EndpointAddress) -> Option<u8> {
        let index = self.bus.lock().config?;
        self.topology.read().configs.get(index)?.owner_of(address)
    }
}

/// A data pipe of a [`Device`]
#[derive(Clone)]
pub struct DevicePipe {
    device: Weak<DeviceInner>,
    lib: Library,
    endpoint: EndpointAddress,
    kind: TransferType,
    sync: Arc<TimedMutex<()>>,
    lock_timeout: u32,
}

impl DevicePipe {
    fn device(&self) -> Result<Arc<DeviceInner>> {
        self.device.upgrade().ok_or(Error::NoDev)
    }

    /// Set or clear the halt condition
    pub fn set_halt(&self, halt: bool) -> Result<()> {
        self.device()?.set_halt(self.endpoint, halt)
    }

    pub fn is_halted(&self) -> Result<bool> {
        self.device()?.is_halted(self.endpoint)
    }

    /// Returns the current max packet size
    pub fn max_packet_size(&self) -> Result<u16> {
        let device = self.device()?;
        let topology = device.topology.read();
        let ep = topology.registry.get(self.endpoint).ok_or(Error::NoDev)?;
        Ok(ep.mps() & 0x7FF)
    }
}

impl TransferPipe for DevicePipe {
    fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }
    fn transfer_type(&self) -> TransferType {
        self.kind
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
        self.device()?.submit(transfer)
    }
    fn cancel(&self, transfer: &Arc<Transfer>) -> Result<()> {
        self.device()?.cancel(transfer)
    }
}
