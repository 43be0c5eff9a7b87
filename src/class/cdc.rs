//! Communications device class, abstract control model (virtual serial port)
//!
//! Two interfaces behind one interface association: a communication
//! interface with an interrupt IN notification endpoint, and a data
//! interface with a bulk pair.

use super::is_class_request;
use crate::descriptor::descriptor_type;
use crate::device::{
    AssociationInfo, ConfigId, ControlReply, Device, DevicePipe, FunctionOps, InterfaceInfo,
    PipeInfo,
};
use crate::error::{Error, Result};
use crate::pipe::TransferPipe;
use crate::setup::SetupPacket;
use alloc::{sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicU16, Ordering};
use spin::Mutex;

pub const CLASS_COMM: u8 = 0x02;
pub const SUBCLASS_ACM: u8 = 0x02;
pub const PROTOCOL_AT: u8 = 0x01;
pub const CLASS_DATA: u8 = 0x0A;

const SEND_ENCAPSULATED_COMMAND: u8 = 0x00;
const GET_ENCAPSULATED_RESPONSE: u8 = 0x01;
const SET_LINE_CODING: u8 = 0x20;
const GET_LINE_CODING: u8 = 0x21;
const SET_CONTROL_LINE_STATE: u8 = 0x22;
const SEND_BREAK: u8 = 0x23;

const SERIAL_STATE: u8 = 0x20;

/// `wValue` bits of SET_CONTROL_LINE_STATE
pub const LINE_DTR: u16 = 1 << 0;
pub const LINE_RTS: u16 = 1 << 1;

/// `UART state bitmap` bits of the SERIAL_STATE notification
pub mod serial_state {
    pub const DCD: u16 = 1 << 0;
    pub const DSR: u16 = 1 << 1;
    pub const BREAK: u16 = 1 << 2;
    pub const RING: u16 = 1 << 3;
    pub const FRAMING: u16 = 1 << 4;
    pub const PARITY: u16 = 1 << 5;
    pub const OVERRUN: u16 = 1 << 6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCoding {
    pub baud_rate: u32,
    /// 0: 1 stop bit, 1: 1.5, 2: 2
    pub stop_bits: u8,
    /// 0: none, 1: odd, 2: even, 3: mark, 4: space
    pub parity: u8,
    pub data_bits: u8,
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            stop_bits: 0,
            parity: 0,
            data_bits: 8,
        }
    }
}

impl LineCoding {
    pub const LEN: usize = 7;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let rate = self.baud_rate.to_le_bytes();
        [
            rate[0],
            rate[1],
            rate[2],
            rate[3],
            self.stop_bits,
            self.parity,
            self.data_bits,
        ]
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::BadF);
        }
        let coding = Self {
            baud_rate: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            stop_bits: buf[4],
            parity: buf[5],
            data_bits: buf[6],
        };
        if coding.stop_bits > 2 || coding.parity > 4 {
            return Err(Error::Inval);
        }
        if !matches!(coding.data_bits, 5..=8 | 16) {
            return Err(Error::Inval);
        }
        Ok(coding)
    }
}

/// Class-specific functional descriptors of the communication interface
fn functional_descriptors(comm: u8, data: u8) -> Vec<u8> {
    vec![
        // Header, CDC 1.10
        5,
        descriptor_type::CS_INTERFACE,
        0x00,
        0x10,
        0x01,
        // Call management, over the communication interface
        5,
        descriptor_type::CS_INTERFACE,
        0x01,
        0x00,
        data,
        // ACM: line coding and serial state
        4,
        descriptor_type::CS_INTERFACE,
        0x02,
        0x02,
        // Union
        5,
        descriptor_type::CS_INTERFACE,
        0x06,
        comm,
        data,
    ]
}

struct AcmOps {
    comm: u8,
    line_coding: Arc<Mutex<LineCoding>>,
    line_state: AtomicU16,
}

impl FunctionOps for AcmOps {
    fn setup(&self, setup: &SetupPacket) -> Result<ControlReply> {
        if !is_class_request(setup, self.comm) {
            return Err(Error::NotSup);
        }
        match setup.request {
            SET_LINE_CODING => {
                let line_coding = Arc::clone(&self.line_coding);
                Ok(ControlReply::data_out(move |data| {
                    let coding = LineCoding::parse(data)?;
                    debug!(
                        "CDC {} baud, {} data bits",
                        coding.baud_rate, coding.data_bits
                    );
                    *line_coding.lock() = coding;
                    Ok(())
                }))
            }
            GET_LINE_CODING => Ok(ControlReply::data_in(self.line_coding.lock().to_bytes())),
            SET_CONTROL_LINE_STATE => {
                self.line_state.store(setup.value, Ordering::Release);
                Ok(ControlReply::ack())
            }
            SEND_BREAK => Ok(ControlReply::ack()),
            // No AT command set
            SEND_ENCAPSULATED_COMMAND | GET_ENCAPSULATED_RESPONSE => Err(Error::NotSup),
            _ => Err(Error::NotSup),
        }
    }

    fn disable(&self, _: u8) {
        self.line_state.store(0, Ordering::Release);
    }
}

/// Data interface; everything happens on its pipes
struct DataOps;

impl FunctionOps for DataOps {}

/// A CDC-ACM function
pub struct CdcAcm {
    ops: Arc<AcmOps>,
    notify: DevicePipe,
    bulk_in: DevicePipe,
    bulk_out: DevicePipe,
}

impl CdcAcm {
    /// Add the function to `config`, on interfaces `first_interface` and
    /// `first_interface + 1`
    pub fn new(
        device: &Device,
        config: ConfigId,
        first_interface: u8,
        max_packet_size: u16,
    ) -> Result<Self> {
        let comm = first_interface;
        let data = first_interface.checked_add(1).ok_or(Error::Inval)?;
        let ops = Arc::new(AcmOps {
            comm,
            line_coding: Arc::new(Mutex::new(LineCoding::default())),
            line_state: AtomicU16::new(0),
        });
        device.add_function_association(
            config,
            AssociationInfo {
                first_interface,
                class: CLASS_COMM,
                subclass: SUBCLASS_ACM,
                protocol: PROTOCOL_AT,
                name: None,
            },
            vec![
                (
                    InterfaceInfo {
                        class: CLASS_COMM,
                        subclass: SUBCLASS_ACM,
                        protocol: PROTOCOL_AT,
                        class_descriptors: functional_descriptors(comm, data),
                        ..Default::default()
                    },
                    ops.clone() as Arc<dyn FunctionOps>,
                ),
                (
                    InterfaceInfo {
                        class: CLASS_DATA,
                        ..Default::default()
                    },
                    Arc::new(DataOps) as Arc<dyn FunctionOps>,
                ),
            ],
        )?;
        let notify = device.add_pipe(config, comm, 0, PipeInfo::interrupt_in(16, 16))?;
        let bulk_in = device.add_pipe(config, data, 0, PipeInfo::bulk_in(max_packet_size))?;
        let bulk_out = device.add_pipe(config, data, 0, PipeInfo::bulk_out(max_packet_size))?;
        Ok(Self {
            ops,
            notify: device.pipe(notify)?,
            bulk_in: device.pipe(bulk_in)?,
            bulk_out: device.pipe(bulk_out)?,
        })
    }

    pub fn line_coding(&self) -> LineCoding {
        *self.ops.line_coding.lock()
    }

    /// Data terminal ready, as set by the host
    pub fn dtr(&self) -> bool {
        self.ops.line_state.load(Ordering::Acquire) & LINE_DTR != 0
    }

    pub fn rts(&self) -> bool {
        self.ops.line_state.load(Ordering::Acquire) & LINE_RTS != 0
    }

    pub fn read(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        self.bulk_out.read(buf, timeout_ms)
    }

    pub fn write(&self, buf: &[u8], timeout_ms: u32) -> Result<usize> {
        self.bulk_in.write(buf, timeout_ms)
    }

    /// Send a SERIAL_STATE notification with the [`serial_state`] bits
    pub fn notify_serial_state(&self, state: u16, timeout_ms: u32) -> Result<()> {
        let comm = u16::from(self.ops.comm).to_le_bytes();
        let state = state.to_le_bytes();
        let notification = [
            0xA1,
            SERIAL_STATE,
            0,
            0,
            comm[0],
            comm[1],
            2,
            0,
            state[0],
            state[1],
        ];
        self.notify.write(&notification, timeout_ms)?;
        Ok(())
    }
}
