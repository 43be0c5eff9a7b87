//! Mass storage, bulk-only transport
//!
//! The host sends a 31 byte command block wrapper (CBW) on the bulk OUT
//! pipe, optionally moves data, and reads a 13 byte command status wrapper
//! (CSW) from the bulk IN pipe. The SCSI commands themselves belong to a
//! [`ScsiTarget`].

use super::is_class_request;
use crate::device::{
    ConfigId, ControlReply, Device, DevicePipe, FunctionOps, InterfaceInfo, PipeInfo,
};
use crate::error::{Error, Result};
use crate::pipe::TransferPipe;
use crate::setup::SetupPacket;
use alloc::{sync::Arc, vec};
use core::sync::atomic::{AtomicBool, Ordering};
use usb_device::UsbDirection;

pub const CLASS: u8 = 0x08;
pub const SUBCLASS_SCSI: u8 = 0x06;
pub const PROTOCOL_BBB: u8 = 0x50;

const GET_MAX_LUN: u8 = 0xFE;
const BOT_RESET: u8 = 0xFF;

/// "USBC"
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// "USBS"
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

/// Command block wrapper
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Cbw {
    pub tag: u32,
    pub data_length: u32,
    /// Bit 7 set for device-to-host data
    pub flags: u8,
    pub lun: u8,
    pub cb_length: u8,
    pub cb: [u8; 16],
}

impl Cbw {
    pub const LEN: usize = 31;

    /// Fails with [`Error::BadF`] on the wrong length, a bad signature, or
    /// a command block length outside 1..=16
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::LEN {
            return Err(Error::BadF);
        }
        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if signature != CBW_SIGNATURE {
            return Err(Error::BadF);
        }
        let cb_length = buf[14] & 0x1F;
        if !(1..=16).contains(&cb_length) {
            return Err(Error::BadF);
        }
        let mut cb = [0; 16];
        cb.copy_from_slice(&buf[15..31]);
        Ok(Self {
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_length: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: buf[12],
            lun: buf[13] & 0x0F,
            cb_length,
            cb,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_length.to_le_bytes());
        buf[12] = self.flags;
        buf[13] = self.lun;
        buf[14] = self.cb_length;
        buf[15..31].copy_from_slice(&self.cb);
        buf
    }

    pub fn direction(&self) -> UsbDirection {
        UsbDirection::from(self.flags)
    }

    /// The SCSI command block
    pub fn command(&self) -> &[u8] {
        &self.cb[..usize::from(self.cb_length)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CswStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

/// Command status wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csw {
    pub tag: u32,
    pub residue: u32,
    pub status: CswStatus,
}

impl Csw {
    pub const LEN: usize = 13;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.residue.to_le_bytes());
        buf[12] = self.status as u8;
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::LEN
            || u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) != CSW_SIGNATURE
        {
            return Err(Error::BadF);
        }
        let status = match buf[12] {
            0 => CswStatus::Passed,
            1 => CswStatus::Failed,
            2 => CswStatus::PhaseError,
            _ => return Err(Error::BadF),
        };
        Ok(Self {
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            residue: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            status,
        })
    }
}

/// Executes SCSI commands for the mass storage function
pub trait ScsiTarget {
    /// A command with a device-to-host data stage, or none
    ///
    /// Fill `data` and return the number of valid bytes. `data` is empty
    /// for commands without data.
    fn command_in(&mut self, lun: u8, command: &[u8], data: &mut [u8]) -> Result<usize>;

    /// A command with a host-to-device data stage
    fn command_out(&mut self, lun: u8, command: &[u8], data: &[u8]) -> Result<()>;
}

struct MscOps {
    interface: u8,
    max_lun: u8,
    reset: AtomicBool,
}

impl FunctionOps for MscOps {
    fn setup(&self, setup: &SetupPacket) -> Result<ControlReply> {
        if !is_class_request(setup, self.interface) {
            return Err(Error::NotSup);
        }
        match setup.request {
            GET_MAX_LUN if setup.length == 1 && setup.value == 0 => {
                Ok(ControlReply::data_in(vec![self.max_lun]))
            }
            BOT_RESET if setup.length == 0 && setup.value == 0 => {
                debug!("MSC RESET");
                self.reset.store(true, Ordering::Release);
                Ok(ControlReply::ack())
            }
            _ => Err(Error::NotSup),
        }
    }

    fn disable(&self, _: u8) {
        self.reset.store(false, Ordering::Release);
    }
}

/// A bulk-only mass storage interface
pub struct MassStorage {
    ops: Arc<MscOps>,
    bulk_in: DevicePipe,
    bulk_out: DevicePipe,
}

impl MassStorage {
    /// Add the interface, with `max_lun + 1` logical units, to `config`
    pub fn new(
        device: &Device,
        config: ConfigId,
        interface: u8,
        max_lun: u8,
        max_packet_size: u16,
    ) -> Result<Self> {
        let ops = Arc::new(MscOps {
            interface,
            max_lun,
            reset: AtomicBool::new(false),
        });
        device.add_function(
            config,
            InterfaceInfo {
                number: interface,
                class: CLASS,
                subclass: SUBCLASS_SCSI,
                protocol: PROTOCOL_BBB,
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

    /// Returns `true` once after the host requested a bulk-only reset
    pub fn take_reset(&self) -> bool {
        self.ops.reset.swap(false, Ordering::AcqRel)
    }

    /// Receive the next CBW
    ///
    /// An invalid CBW stalls the bulk IN pipe, and the call fails with
    /// [`Error::BadF`]. The host recovers with a reset.
    pub fn cmd_get(&self, timeout_ms: u32) -> Result<Cbw> {
        let mut buf = [0; Cbw::LEN + 1];
        let len = self.bulk_out.read(&mut buf, timeout_ms)?;
        match Cbw::parse(&buf[..len]) {
            Ok(cbw) => {
                trace!("CBW tag {} length {}", cbw.tag, cbw.data_length);
                Ok(cbw)
            }
            Err(err) => {
                warn!("MSC invalid CBW, {} bytes", len);
                self.bulk_in.set_halt(true)?;
                Err(err)
            }
        }
    }

    pub fn csw_send(&self, csw: &Csw, timeout_ms: u32) -> Result<()> {
        self.bulk_in.write(&csw.to_bytes(), timeout_ms)?;
        Ok(())
    }

    /// Send data for the current command
    pub fn data_in(&self, data: &[u8], timeout_ms: u32) -> Result<usize> {
        self.bulk_in.write(data, timeout_ms)
    }

    /// Receive data for the current command
    pub fn data_out(&self, data: &mut [u8], timeout_ms: u32) -> Result<usize> {
        self.bulk_out.read(data, timeout_ms)
    }

    /// Run one command: CBW, data stage, CSW
    ///
    /// `buf` bounds the data stage; anything beyond it is reported as
    /// residue.
    pub fn process_command(
        &self,
        target: &mut dyn ScsiTarget,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<()> {
        let cbw = self.cmd_get(timeout_ms)?;
        let expected = cbw.data_length as usize;
        let window = expected.min(buf.len());

        let (done, status) = if cbw.lun > self.ops.max_lun {
            (0, CswStatus::Failed)
        } else if expected == 0 || cbw.direction() == UsbDirection::In {
            match target.command_in(cbw.lun, cbw.command(), &mut buf[..window]) {
                Ok(len) if len > window => (0, CswStatus::PhaseError),
                Ok(0) => (0, CswStatus::Passed),
                Ok(len) => (self.data_in(&buf[..len], timeout_ms)?, CswStatus::Passed),
                Err(err) => {
                    debug!("SCSI {:x} failed: {:?}", cbw.cb[0], err);
                    (0, CswStatus::Failed)
                }
            }
        } else {
            let len = self.data_out(&mut buf[..window], timeout_ms)?;
            match target.command_out(cbw.lun, cbw.command(), &buf[..len]) {
                Ok(()) => (len, CswStatus::Passed),
                Err(err) => {
                    debug!("SCSI {:x} failed: {:?}", cbw.cb[0], err);
                    (len, CswStatus::Failed)
                }
            }
        };

        let csw = Csw {
            tag: cbw.tag,
            residue: (expected - done.min(expected)) as u32,
            status,
        };
        self.csw_send(&csw, timeout_ms)
    }
}
