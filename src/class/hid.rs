//! Human interface device

use super::is_class_request;
use crate::descriptor::descriptor_type;
use crate::device::{
    ConfigId, ControlReply, Device, DevicePipe, FunctionOps, InterfaceInfo, PipeInfo,
};
use crate::error::{Error, Result};
use crate::pipe::TransferPipe;
use crate::setup::SetupPacket;
use alloc::{sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;
use usb_device::control::{Recipient, Request, RequestType};

pub const CLASS: u8 = 0x03;
pub const SUBCLASS_BOOT: u8 = 0x01;
pub const PROTOCOL_KEYBOARD: u8 = 0x01;
pub const PROTOCOL_MOUSE: u8 = 0x02;

const GET_REPORT: u8 = 0x01;
const GET_IDLE: u8 = 0x02;
const GET_PROTOCOL: u8 = 0x03;
const SET_REPORT: u8 = 0x09;
const SET_IDLE: u8 = 0x0A;
const SET_PROTOCOL: u8 = 0x0B;

/// Report types in the high byte of `wValue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReportType {
    Input = 1,
    Output = 2,
    Feature = 3,
}

/// Boot protocol, or report protocol
pub const PROTOCOL_BOOT_MODE: u8 = 0;
pub const PROTOCOL_REPORT_MODE: u8 = 1;

/// How to build a HID interface
#[derive(Debug, Clone)]
pub struct HidInfo {
    pub subclass: u8,
    pub protocol: u8,
    pub report_descriptor: Vec<u8>,
    pub max_packet_size: u16,
    /// Polling interval of the interrupt endpoints
    pub interval: u8,
    /// Add an interrupt OUT endpoint for output reports
    pub out_endpoint: bool,
}

/// The HID class descriptor that follows the interface descriptor
fn hid_descriptor(report_len: usize) -> [u8; 9] {
    let len = (report_len as u16).to_le_bytes();
    [
        9,
        descriptor_type::HID,
        0x11,
        0x01,
        0,
        1,
        descriptor_type::HID_REPORT,
        len[0],
        len[1],
    ]
}

struct HidOps {
    interface: u8,
    report_descriptor: Vec<u8>,
    idle: AtomicU8,
    protocol: AtomicU8,
    input: Mutex<Vec<u8>>,
    output: Arc<Mutex<Option<Vec<u8>>>>,
}

impl HidOps {
    fn get_descriptor(&self, setup: &SetupPacket) -> Result<ControlReply> {
        let (kind, _) = setup.descriptor_type_index();
        match kind {
            descriptor_type::HID_REPORT => {
                Ok(ControlReply::data_in(self.report_descriptor.clone()))
            }
            descriptor_type::HID => Ok(ControlReply::data_in(hid_descriptor(
                self.report_descriptor.len(),
            ))),
            _ => Err(Error::NotSup),
        }
    }
}

impl FunctionOps for HidOps {
    fn setup(&self, setup: &SetupPacket) -> Result<ControlReply> {
        if setup.request_kind() == RequestType::Standard
            && setup.recipient() == Recipient::Interface
            && setup.request == Request::GET_DESCRIPTOR
        {
            return self.get_descriptor(setup);
        }
        if !is_class_request(setup, self.interface) {
            return Err(Error::NotSup);
        }
        let [report_id, report_type] = setup.value.to_le_bytes();
        match setup.request {
            GET_REPORT if report_type == ReportType::Input as u8 => {
                let input = self.input.lock();
                if input.is_empty() {
                    Ok(ControlReply::data_in(vec![0; usize::from(setup.length)]))
                } else {
                    Ok(ControlReply::data_in(input.clone()))
                }
            }
            SET_REPORT if report_type == ReportType::Output as u8 => {
                let output = Arc::clone(&self.output);
                trace!("HID SET_REPORT {}", report_id);
                Ok(ControlReply::data_out(move |data| {
                    *output.lock() = Some(data.to_vec());
                    Ok(())
                }))
            }
            GET_IDLE => Ok(ControlReply::data_in(vec![self.idle.load(Ordering::Relaxed)])),
            SET_IDLE => {
                self.idle.store(report_type, Ordering::Relaxed);
                Ok(ControlReply::ack())
            }
            GET_PROTOCOL => Ok(ControlReply::data_in(vec![
                self.protocol.load(Ordering::Relaxed)
            ])),
            SET_PROTOCOL if setup.value <= u16::from(PROTOCOL_REPORT_MODE) => {
                self.protocol.store(report_id, Ordering::Relaxed);
                Ok(ControlReply::ack())
            }
            _ => Err(Error::NotSup),
        }
    }

    fn disable(&self, _: u8) {
        self.protocol.store(PROTOCOL_REPORT_MODE, Ordering::Relaxed);
        self.idle.store(0, Ordering::Relaxed);
    }
}

/// A HID interface with an interrupt IN endpoint, and optionally an
/// interrupt OUT endpoint
pub struct Hid {
    ops: Arc<HidOps>,
    interrupt_in: DevicePipe,
    interrupt_out: Option<DevicePipe>,
}

impl Hid {
    pub fn new(device: &Device, config: ConfigId, interface: u8, info: HidInfo) -> Result<Self> {
        let ops = Arc::new(HidOps {
            interface,
            idle: AtomicU8::new(0),
            protocol: AtomicU8::new(PROTOCOL_REPORT_MODE),
            input: Mutex::new(Vec::new()),
            output: Arc::new(Mutex::new(None)),
            report_descriptor: info.report_descriptor,
        });
        device.add_function(
            config,
            InterfaceInfo {
                number: interface,
                class: CLASS,
                subclass: info.subclass,
                protocol: info.protocol,
                class_descriptors: hid_descriptor(ops.report_descriptor.len()).to_vec(),
                ..Default::default()
            },
            ops.clone(),
        )?;
        let pipe = PipeInfo::interrupt_in(info.max_packet_size, info.interval);
        let interrupt_in = device.pipe(device.add_pipe(config, interface, 0, pipe)?)?;
        let interrupt_out = if info.out_endpoint {
            let pipe = PipeInfo::interrupt_out(info.max_packet_size, info.interval);
            Some(device.pipe(device.add_pipe(config, interface, 0, pipe)?)?)
        } else {
            None
        };
        Ok(Self {
            ops,
            interrupt_in,
            interrupt_out,
        })
    }

    /// Send an input report
    ///
    /// The report also answers GET_REPORT(Input) from now on.
    pub fn write_report(&self, report: &[u8], timeout_ms: u32) -> Result<usize> {
        *self.ops.input.lock() = report.to_vec();
        self.interrupt_in.write(report, timeout_ms)
    }

    /// Receive an output report on the interrupt OUT endpoint
    pub fn read_report(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        match &self.interrupt_out {
            Some(pipe) => pipe.read(buf, timeout_ms),
            None => Err(Error::NotSup),
        }
    }

    /// Returns the last output report the host sent with SET_REPORT
    pub fn take_output_report(&self) -> Option<Vec<u8>> {
        self.ops.output.lock().take()
    }

    /// Idle rate in 4 ms units; zero means report only on change
    pub fn idle_rate(&self) -> u8 {
        self.ops.idle.load(Ordering::Relaxed)
    }

    pub fn protocol(&self) -> u8 {
        self.ops.protocol.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::{Hid, HidInfo, PROTOCOL_BOOT_MODE, PROTOCOL_REPORT_MODE, SUBCLASS_BOOT};
    use crate::descriptor::descriptor_type;
    use crate::setup::SetupPacket;
    use crate::testing::{self, DeviceFixture};
    use crate::Error;
    use alloc::vec::Vec;
    use usb_device::control::{Recipient, RequestType};
    use usb_device::UsbDirection;

    const REPORT: [u8; 6] = [0x05, 0x01, 0x09, 0x02, 0xA1, 0xC0];

    fn hid(out_endpoint: bool) -> (DeviceFixture, Hid) {
        let fixture = testing::device();
        let config = fixture.device.add_config(None).unwrap();
        let hid = Hid::new(
            &fixture.device,
            config,
            0,
            HidInfo {
                subclass: SUBCLASS_BOOT,
                protocol: super::PROTOCOL_MOUSE,
                report_descriptor: REPORT.to_vec(),
                max_packet_size: 8,
                interval: 10,
                out_endpoint,
            },
        )
        .unwrap();
        fixture.device.run().unwrap();
        fixture.address_and_configure(config.value());
        (fixture, hid)
    }

    fn class(direction: UsbDirection, request: u8, value: u16, length: u16) -> SetupPacket {
        SetupPacket::new(
            direction,
            RequestType::Class,
            Recipient::Interface,
            request,
            value,
            0,
            length,
        )
    }

    /// Run an IN request and return the data stage
    fn control_in(fixture: &DeviceFixture, setup: SetupPacket) -> Vec<u8> {
        fixture.device.setup_received(&setup.to_bytes()).unwrap();
        let data = fixture.driver.take(0x80).unwrap();
        let bytes = data.with_buffer(|buf| buf[..data.length()].to_vec());
        data.complete(Ok(bytes.len()));
        fixture.driver.take(0x00).unwrap().complete(Ok(0));
        bytes
    }

    #[test]
    fn report_descriptor() {
        let (fixture, _hid) = hid(false);
        let mut setup = SetupPacket::get_descriptor(descriptor_type::HID_REPORT, 0, 0, 128);
        setup.request_type |= Recipient::Interface as u8;
        assert_eq!(control_in(&fixture, setup), REPORT);

        let mut setup = SetupPacket::get_descriptor(descriptor_type::HID, 0, 0, 9);
        setup.request_type |= Recipient::Interface as u8;
        let hid = control_in(&fixture, setup);
        assert_eq!(hid[1], descriptor_type::HID);
        assert_eq!(hid[7], REPORT.len() as u8);

        let config = fixture.device.config_descriptor(super::ConfigId(2)).unwrap();
        assert!(config.windows(2).any(|w| w == [9, descriptor_type::HID]));
    }

    #[test]
    fn idle_and_protocol() {
        let (fixture, hid) = hid(false);
        assert_eq!(hid.protocol(), PROTOCOL_REPORT_MODE);
        fixture.no_data_request(class(UsbDirection::Out, super::SET_IDLE, 0x7D00, 0));
        assert_eq!(hid.idle_rate(), 0x7D);
        assert_eq!(
            control_in(&fixture, class(UsbDirection::In, super::GET_IDLE, 0, 1)),
            [0x7D]
        );

        fixture.no_data_request(class(UsbDirection::Out, super::SET_PROTOCOL, 0, 0));
        assert_eq!(hid.protocol(), PROTOCOL_BOOT_MODE);
        assert_eq!(
            control_in(&fixture, class(UsbDirection::In, super::GET_PROTOCOL, 0, 1)),
            [PROTOCOL_BOOT_MODE]
        );
    }

    #[test]
    fn reports() {
        let (fixture, hid) = hid(false);
        fixture.driver.set_responder(|transfer| {
            (transfer.endpoint().index() != 0).then(|| Ok(transfer.length()))
        });
        assert_eq!(hid.write_report(&[1, 2, 3], 1000), Ok(3));
        assert_eq!(
            control_in(&fixture, class(UsbDirection::In, super::GET_REPORT, 0x0100, 3)),
            [1, 2, 3]
        );

        let set_report = class(UsbDirection::Out, super::SET_REPORT, 0x0200, 1);
        fixture.device.setup_received(&set_report.to_bytes()).unwrap();
        let data = fixture.driver.take(0x00).unwrap();
        data.with_buffer(|buf| buf[0] = 0x02);
        data.complete(Ok(1));
        fixture.driver.take(0x80).unwrap().complete(Ok(0));
        assert_eq!(hid.take_output_report(), Some([0x02].to_vec()));
        assert_eq!(hid.take_output_report(), None);

        let mut buf = [0; 8];
        assert_eq!(hid.read_report(&mut buf, 10), Err(Error::NotSup));
    }
}
