//! Printer class, bidirectional

use super::is_class_request;
use crate::device::{
    ConfigId, ControlReply, Device, DevicePipe, FunctionOps, InterfaceInfo, PipeInfo,
};
use crate::error::{Error, Result};
use crate::pipe::TransferPipe;
use crate::setup::SetupPacket;
use alloc::{sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

pub const CLASS: u8 = 0x07;
pub const SUBCLASS: u8 = 0x01;
pub const PROTOCOL_BIDIRECTIONAL: u8 = 0x02;

const GET_DEVICE_ID: u8 = 0x00;
const GET_PORT_STATUS: u8 = 0x01;
const SOFT_RESET: u8 = 0x02;

/// GET_PORT_STATUS bits
pub mod port_status {
    pub const NOT_ERROR: u8 = 1 << 3;
    pub const SELECTED: u8 = 1 << 4;
    pub const PAPER_EMPTY: u8 = 1 << 5;
}

struct PrinterOps {
    interface: u8,
    device_id: Vec<u8>,
    port_status: AtomicU8,
    reset: AtomicBool,
}

impl FunctionOps for PrinterOps {
    fn setup(&self, setup: &SetupPacket) -> Result<ControlReply> {
        // GET_DEVICE_ID carries the interface in the high byte of wIndex
        let interface = match setup.request {
            GET_DEVICE_ID => (setup.index >> 8) as u8,
            _ => setup.index as u8,
        };
        let mut routed = *setup;
        routed.index = u16::from(interface);
        if !is_class_request(&routed, self.interface) {
            return Err(Error::NotSup);
        }
        match setup.request {
            GET_DEVICE_ID => Ok(ControlReply::data_in(self.device_id.clone())),
            GET_PORT_STATUS => Ok(ControlReply::data_in(vec![
                self.port_status.load(Ordering::Relaxed)
            ])),
            SOFT_RESET => {
                debug!("PRINTER SOFT_RESET");
                self.reset.store(true, Ordering::Release);
                Ok(ControlReply::ack())
            }
            _ => Err(Error::NotSup),
        }
    }
}

/// A bidirectional printer interface
pub struct Printer {
    ops: Arc<PrinterOps>,
    bulk_in: DevicePipe,
    bulk_out: DevicePipe,
}

impl Printer {
    /// Add the interface to `config`
    ///
    /// `device_id` is the IEEE 1284 device ID string, e.g.
    /// `"MFG:Acme;MDL:Laser;CMD:PCL;"`.
    pub fn new(
        device: &Device,
        config: ConfigId,
        interface: u8,
        device_id: &str,
        max_packet_size: u16,
    ) -> Result<Self> {
        let len = u16::try_from(device_id.len() + 2).map_err(|_| Error::Size)?;
        let mut id = len.to_be_bytes().to_vec();
        id.extend_from_slice(device_id.as_bytes());
        let ops = Arc::new(PrinterOps {
            interface,
            device_id: id,
            port_status: AtomicU8::new(port_status::NOT_ERROR | port_status::SELECTED),
            reset: AtomicBool::new(false),
        });
        device.add_function(
            config,
            InterfaceInfo {
                number: interface,
                class: CLASS,
                subclass: SUBCLASS,
                protocol: PROTOCOL_BIDIRECTIONAL,
                ..Default::default()
            },
            ops.clone(),
        )?;
        let bulk_in = PipeInfo::bulk_in(max_packet_size);
        let bulk_in = device.add_pipe(config, interface, 0, bulk_in)?;
        let bulk_out = PipeInfo::bulk_out(max_packet_size);
        let bulk_out = device.add_pipe(config, interface, 0, bulk_out)?;
        Ok(Self {
            ops,
            bulk_in: device.pipe(bulk_in)?,
            bulk_out: device.pipe(bulk_out)?,
        })
    }

    /// Set the [`port_status`] bits answered to GET_PORT_STATUS
    pub fn set_port_status(&self, status: u8) {
        self.ops.port_status.store(status, Ordering::Relaxed);
    }

    /// Returns `true` once after the host sent SOFT_RESET
    pub fn take_soft_reset(&self) -> bool {
        self.ops.reset.swap(false, Ordering::AcqRel)
    }

    /// Receive print data
    pub fn read(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        self.bulk_out.read(buf, timeout_ms)
    }

    /// Send status data back to the host
    pub fn write(&self, buf: &[u8], timeout_ms: u32) -> Result<usize> {
        self.bulk_in.write(buf, timeout_ms)
    }
}
