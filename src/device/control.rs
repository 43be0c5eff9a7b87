//! Endpoint zero: the control transfer state machine and standard requests
//!
//! ```text
//!            SETUP, wLength == 0
//!   Idle ─────────────────────────────────────────▶ AwaitingStatus (IN ZLP)
//!     │       SETUP, wLength > 0                           ▲         │
//!     └──────────────────────▶ AwaitingData ──data done───┘         │
//!                               (IN or OUT)   (ZLP, opposite dir)     │
//!   Idle ◀─────────────────────────────────────────status done───────┘
//! ```
//!
//! The completion of each stage starts the next one. Any error stalls
//! endpoint zero and returns to idle.

use super::function::{ControlReply, OutHandler, ReplyData, StatusHook};
use super::{strings, DeviceInner, DeviceState, FunctionOps};
use crate::descriptor::{descriptor_type, DeviceQualifierDescriptor};
use crate::error::{Error, Result};
use crate::setup::SetupPacket;
use crate::transfer::{Transfer, TransferFlags, TransferStatus};
use crate::Speed;
use alloc::{sync::Arc, vec, vec::Vec};
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::{endpoint::EndpointAddress, UsbDirection};

pub(crate) enum Stage {
    Idle,
    AwaitingData {
        direction: UsbDirection,
        handler: Option<OutHandler>,
        hook: Option<StatusHook>,
    },
    AwaitingStatus {
        direction: UsbDirection,
        hook: Option<StatusHook>,
    },
}

fn opposite(direction: UsbDirection) -> UsbDirection {
    match direction {
        UsbDirection::In => UsbDirection::Out,
        UsbDirection::Out => UsbDirection::In,
    }
}

impl DeviceInner {
    fn ep0(&self, direction: UsbDirection) -> &Arc<Transfer> {
        match direction {
            UsbDirection::In => &self.ep0_in,
            UsbDirection::Out => &self.ep0_out,
        }
    }

    fn ep0_stall(&self) {
        *self.control.lock() = Stage::Idle;
        if let Err(err) = self.with_driver(|driver| driver.ep0_stall()) {
            error!("EP0 STALL {:?}", err);
        }
    }

    /// Drop whatever control transfer is in flight
    pub(super) fn control_abort(&self) {
        let previous = core::mem::replace(&mut *self.control.lock(), Stage::Idle);
        if !matches!(previous, Stage::Idle) {
            debug!("EP0 ABORT");
        }
        for transfer in [&self.ep0_in, &self.ep0_out] {
            if let Err(err) = self.cancel(transfer) {
                warn!("EP0 CANCEL {:?}", err);
            }
        }
    }

    /// Start a zero length status stage
    fn status_stage(&self, direction: UsbDirection, hook: Option<StatusHook>) -> Result<()> {
        let transfer = self.ep0(direction);
        transfer.set_flags(TransferFlags::empty())?;
        transfer.set_length(0)?;
        *self.control.lock() = Stage::AwaitingStatus { direction, hook };
        self.start(transfer)
    }

    pub(super) fn setup_received(&self, raw: &[u8]) -> Result<()> {
        let setup = SetupPacket::from_bytes(raw)?;
        trace!(
            "SETUP {:x} {:x} {:x} {:x} {}",
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            setup.length
        );
        self.control_abort();
        let result = self
            .dispatch(&setup)
            .and_then(|reply| self.control_start(&setup, reply));
        if let Err(err) = result {
            warn!(
                "EP0 STALL request {:x} type {:x}: {:?}",
                setup.request, setup.request_type, err
            );
            self.ep0_stall();
        }
        result
    }

    /// Run the data stage, or go straight to the status stage
    fn control_start(&self, setup: &SetupPacket, reply: ControlReply) -> Result<()> {
        let ControlReply { data, on_status } = reply;
        if !setup.has_data() {
            return self.status_stage(UsbDirection::In, on_status);
        }
        let length = usize::from(setup.length);
        match (setup.direction(), data) {
            (UsbDirection::In, ReplyData::In(bytes)) => {
                let len = bytes.len().min(length);
                self.ep0_in.fill(&bytes[..len])?;
                let flags = if len < length {
                    TransferFlags::ZERO_PACKET
                } else {
                    TransferFlags::empty()
                };
                self.ep0_in.set_flags(flags)?;
                *self.control.lock() = Stage::AwaitingData {
                    direction: UsbDirection::In,
                    handler: None,
                    hook: on_status,
                };
                self.start(&self.ep0_in)
            }
            (UsbDirection::Out, ReplyData::Out(handler)) => {
                self.ep0_out.set_length(length)?;
                *self.control.lock() = Stage::AwaitingData {
                    direction: UsbDirection::Out,
                    handler: Some(handler),
                    hook: on_status,
                };
                self.start(&self.ep0_out)
            }
            _ => Err(Error::Fault),
        }
    }

    /// Completion of any endpoint zero transfer
    pub(super) fn ep0_complete(&self, transfer: &Transfer) {
        let direction = transfer.direction();
        let stage = core::mem::replace(&mut *self.control.lock(), Stage::Idle);
        let status = transfer.status();
        match stage {
            Stage::AwaitingData {
                direction: expected,
                handler,
                hook,
            } if expected == direction => {
                if status != TransferStatus::Complete {
                    warn!("EP0 data stage {:?}", status);
                    return self.ep0_stall();
                }
                if let Some(handler) = handler {
                    let actual = transfer.actual_length();
                    if let Err(err) = transfer.with_buffer(|buf| handler(&buf[..actual])) {
                        warn!("EP0 OUT handler {:?}", err);
                        return self.ep0_stall();
                    }
                }
                if let Err(err) = self.status_stage(opposite(direction), hook) {
                    warn!("EP0 status stage {:?}", err);
                    self.ep0_stall();
                }
            }
            Stage::AwaitingStatus {
                direction: expected,
                hook,
            } if expected == direction => {
                if status == TransferStatus::Complete {
                    trace!("EP0 status done");
                    if let Some(hook) = hook {
                        hook();
                    }
                }
            }
            // Cancelled by a new SETUP, or a stale completion.
            other => *self.control.lock() = other,
        }
    }

    fn dispatch(&self, setup: &SetupPacket) -> Result<ControlReply> {
        match setup.request_kind() {
            RequestType::Standard => match setup.recipient() {
                Recipient::Device => self.standard_device(setup),
                Recipient::Interface => self.standard_interface(setup),
                Recipient::Endpoint => self.standard_endpoint(setup),
                _ => Err(Error::NotSup),
            },
            RequestType::Class | RequestType::Vendor => self.function_request(setup),
            RequestType::Reserved => Err(Error::Illegal),
        }
    }

    fn standard_device(&self, setup: &SetupPacket) -> Result<ControlReply> {
        match setup.request {
            Request::GET_STATUS => Ok(ControlReply::data_in(vec![0, 0])),
            Request::CLEAR_FEATURE | Request::SET_FEATURE => {
                if setup.value != Request::FEATURE_DEVICE_REMOTE_WAKEUP {
                    return Err(Error::NotSup);
                }
                self.bus.lock().remote_wakeup = setup.request == Request::SET_FEATURE;
                Ok(ControlReply::ack())
            }
            Request::SET_ADDRESS => self.set_address(setup.value),
            Request::GET_DESCRIPTOR => self.get_descriptor(setup).map(ControlReply::data_in),
            Request::GET_CONFIGURATION => {
                Ok(ControlReply::data_in(vec![self.configuration_value()]))
            }
            Request::SET_CONFIGURATION => {
                let value = u8::try_from(setup.value).map_err(|_| Error::Inval)?;
                self.set_configuration(value)?;
                Ok(ControlReply::ack())
            }
            _ => Err(Error::NotSup),
        }
    }

    fn set_address(&self, value: u16) -> Result<ControlReply> {
        let address = u8::try_from(value)
            .ok()
            .filter(|address| *address <= 127)
            .ok_or(Error::Inval)?;
        {
            let mut bus = self.bus.lock();
            if bus.state == DeviceState::Configured {
                return Err(Error::Perm);
            }
            bus.address = address;
            bus.state = if address == 0 {
                DeviceState::Default
            } else {
                DeviceState::Address
            };
        }
        debug!("ADDRESS {}", address);
        if self.driver.set_address_before_status() {
            self.with_driver(|driver| driver.addr_set(address))?;
            Ok(ControlReply::ack())
        } else {
            let driver = Arc::clone(&self.driver);
            Ok(ControlReply::ack().on_status(move || {
                if let Err(err) = driver.addr_set(address) {
                    error!("ADDRESS {} {:?}", address, err);
                }
            }))
        }
    }

    fn get_descriptor(&self, setup: &SetupPacket) -> Result<Vec<u8>> {
        let (kind, index) = setup.descriptor_type_index();
        let speed = self.bus.lock().speed;
        let high_speed_capable = self.options.speed == Speed::High;
        let topology = self.topology.read();

        let mut device = self.descriptor;
        device.num_configurations = topology.configs.len() as u8;
        device.max_packet_size0 = if speed == Speed::High {
            64
        } else {
            device.max_packet_size0
        };
        device.manufacturer = topology.strings.index_of(strings::MANUFACTURER);
        device.product = topology.strings.index_of(strings::PRODUCT);
        device.serial_number = topology.strings.index_of(strings::SERIAL_NUMBER);

        match kind {
            descriptor_type::DEVICE => Ok(device.to_bytes().to_vec()),
            descriptor_type::CONFIGURATION | descriptor_type::OTHER_SPEED_CONFIGURATION => {
                let speed = if kind == descriptor_type::CONFIGURATION {
                    speed
                } else if !high_speed_capable {
                    return Err(Error::NotSup);
                } else if speed == Speed::High {
                    Speed::Full
                } else {
                    Speed::High
                };
                let config = topology
                    .configs
                    .get(usize::from(index))
                    .ok_or(Error::Inval)?;
                let mut buf = vec![0; config.total_len()];
                let len = config.serialize(&mut buf, kind, speed)?;
                buf.truncate(len);
                Ok(buf)
            }
            descriptor_type::STRING if index == 0 => Ok(topology.strings.lang_ids()),
            descriptor_type::STRING => topology
                .strings
                .get(index)
                .map(<[u8]>::to_vec)
                .ok_or(Error::NotSup),
            descriptor_type::DEVICE_QUALIFIER if high_speed_capable => {
                Ok(DeviceQualifierDescriptor::for_device(&device).to_bytes().to_vec())
            }
            descriptor_type::BOS => topology.bos.clone().ok_or(Error::NotSup),
            _ => Err(Error::NotSup),
        }
    }

    fn standard_interface(&self, setup: &SetupPacket) -> Result<ControlReply> {
        let interface = setup.index as u8;
        let (ops, alt) = self.interface_ops(interface).ok_or(Error::Inval)?;
        match setup.request {
            Request::GET_STATUS => Ok(ControlReply::data_in(vec![0, 0])),
            Request::GET_INTERFACE => {
                let alt = ops.alt_get(interface).unwrap_or(alt);
                Ok(ControlReply::data_in(vec![alt]))
            }
            Request::SET_INTERFACE => {
                let alt = u8::try_from(setup.value).map_err(|_| Error::Inval)?;
                self.set_interface(interface, alt)?;
                Ok(ControlReply::ack())
            }
            _ => ops.setup(setup),
        }
    }

    fn standard_endpoint(&self, setup: &SetupPacket) -> Result<ControlReply> {
        let address = EndpointAddress::from(setup.index as u8);
        let halt = setup.value == Request::FEATURE_ENDPOINT_HALT;
        if address.index() == 0 {
            return match setup.request {
                Request::GET_STATUS => Ok(ControlReply::data_in(vec![0, 0])),
                Request::CLEAR_FEATURE | Request::SET_FEATURE if halt => Ok(ControlReply::ack()),
                _ => Err(Error::NotSup),
            };
        }
        {
            let topology = self.topology.read();
            let ep = topology.registry.get(address).ok_or(Error::NoDev)?;
            if !ep.is_enabled() {
                return Err(Error::Inval);
            }
        }
        match setup.request {
            Request::GET_STATUS => {
                let halted = self.is_halted(address)?;
                Ok(ControlReply::data_in(vec![u8::from(halted), 0]))
            }
            Request::CLEAR_FEATURE if halt => {
                self.set_halt(address, false)?;
                debug!("EP{} {:?} HALT CLEAR", address.index(), address.direction());
                Ok(ControlReply::ack())
            }
            Request::SET_FEATURE if halt => {
                self.set_halt(address, true)?;
                debug!("EP{} {:?} HALT", address.index(), address.direction());
                Ok(ControlReply::ack())
            }
            _ => Err(Error::NotSup),
        }
    }

    /// Route a class or vendor request to the function it addresses
    fn function_request(&self, setup: &SetupPacket) -> Result<ControlReply> {
        let vendor = || -> Result<ControlReply> {
            let handler: Option<Arc<dyn FunctionOps>> = self.topology.read().vendor.clone();
            match (setup.request_kind(), handler) {
                (RequestType::Vendor, Some(handler)) => handler.setup(setup),
                _ => Err(Error::NotSup),
            }
        };
        let ops = match setup.recipient() {
            Recipient::Interface => self.interface_ops(setup.index as u8).map(|(ops, _)| ops),
            Recipient::Endpoint => self
                .endpoint_owner(EndpointAddress::from(setup.index as u8))
                .and_then(|interface| self.interface_ops(interface))
                .map(|(ops, _)| ops),
            _ => None,
        };
        match ops {
            Some(ops) => match ops.setup(setup) {
                Err(Error::NotSup) => vendor(),
                result => result,
            },
            None => vendor(),
        }
    }
}
