//! Host control transfers
//!
//! A control transfer runs as up to three hardware requests on endpoint
//! zero. Each stage's completion starts the next one:
//!
//! ```text
//!  Setup ──▶ Data (IN|OUT) ──▶ Status (OUT|IN) ──▶ Done
//!    │                              ▲
//!    └──────── wLength == 0 ────────┘ (status IN)
//! ```
//!
//! Any failed stage ends the run with that stage's error.

use super::{HostEndpoint, HostInner};
use crate::error::{Error, Result};
use crate::os::Completion;
use crate::pipe::Data;
use crate::setup::SetupPacket;
use crate::transfer::{Transfer, TransferFlags, TransferStatus, TransferType};
use alloc::sync::{Arc, Weak};
use spin::Mutex;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Setup,
    Data,
    Status,
    Done,
}

struct ControlRun {
    host: Weak<HostInner>,
    ep0: HostEndpoint,
    stage: Mutex<Stage>,
    setup: Arc<Transfer>,
    data: Option<Arc<Transfer>>,
    status: Arc<Transfer>,
    result: Mutex<Option<Result<usize>>>,
    done: Completion,
}

fn ep0(direction: UsbDirection) -> EndpointAddress {
    EndpointAddress::from_parts(0, direction)
}

impl ControlRun {
    fn new(host: &Arc<HostInner>, ep0_desc: HostEndpoint, setup: &SetupPacket) -> Arc<Self> {
        let align = host.lib.dma().align();
        Arc::new_cyclic(|weak: &Weak<ControlRun>| {
            let stage = |address, capacity| {
                let weak = Weak::clone(weak);
                Transfer::builder(address, TransferType::Control)
                    .capacity(capacity)
                    .align(align)
                    .callback(move |transfer| match weak.upgrade() {
                        Some(run) => run.advance(transfer),
                        None => warn!("late control completion discarded"),
                    })
            };
            let setup_stage = stage(ep0(UsbDirection::Out), SetupPacket::LEN)
                .buffer(setup.to_bytes().to_vec())
                .flags(TransferFlags::SETUP)
                .build();
            let data = setup
                .has_data()
                .then(|| stage(ep0(setup.direction()), usize::from(setup.length)).build());
            let status_direction = match setup.has_data() {
                true if setup.direction() == UsbDirection::In => UsbDirection::Out,
                _ => UsbDirection::In,
            };
            ControlRun {
                host: Arc::downgrade(host),
                ep0: ep0_desc,
                stage: Mutex::new(Stage::Setup),
                setup: setup_stage,
                data,
                status: stage(ep0(status_direction), 0).build(),
                result: Mutex::new(None),
                done: Completion::new(),
            }
        })
    }

    fn current(&self) -> Option<&Arc<Transfer>> {
        match *self.stage.lock() {
            Stage::Setup => Some(&self.setup),
            Stage::Data => self.data.as_ref(),
            Stage::Status => Some(&self.status),
            Stage::Done => None,
        }
    }

    fn finish(&self, result: Result<usize>) {
        *self.stage.lock() = Stage::Done;
        *self.result.lock() = Some(result);
        if !self.done.signal() {
            warn!("control transfer finished after its caller gave up");
        }
    }

    /// Runs from each stage's completion
    fn advance(&self, transfer: &Transfer) {
        let next = {
            let mut stage = self.stage.lock();
            let expected = match *stage {
                Stage::Setup => Some(&self.setup),
                Stage::Data => self.data.as_ref(),
                Stage::Status => Some(&self.status),
                Stage::Done => None,
            };
            if !expected.is_some_and(|expected| core::ptr::eq(&**expected, transfer)) {
                return;
            }
            match transfer.status() {
                TransferStatus::Complete => {}
                TransferStatus::Failed(err) => {
                    debug!("control stage failed: {:?}", err);
                    drop(stage);
                    self.finish(Err(err));
                    return;
                }
                TransferStatus::Idle | TransferStatus::InProgress => return,
            }
            match (*stage, &self.data) {
                (Stage::Setup, Some(data)) => {
                    *stage = Stage::Data;
                    Arc::clone(data)
                }
                (Stage::Setup, None) | (Stage::Data, _) => {
                    *stage = Stage::Status;
                    Arc::clone(&self.status)
                }
                (Stage::Status, _) | (Stage::Done, _) => {
                    drop(stage);
                    let actual = self.data.as_ref().map_or(0, |data| data.actual_length());
                    self.finish(Ok(actual));
                    return;
                }
            }
        };
        let result = match self.host.upgrade() {
            Some(host) => host.submit(&self.ep0, &next),
            None => Err(Error::NoDev),
        };
        if let Err(err) = result {
            self.finish(Err(err));
        }
    }
}

/// Run one control transfer on `ep0`, waiting at most `timeout_ms`
///
/// `wLength` of `setup` decides the data stage. An IN data stage needs a
/// buffer of at least `wLength` bytes; an OUT data stage sends exactly
/// `wLength` bytes. Returns the number of data bytes transferred.
pub(crate) fn run(
    host: &Arc<HostInner>,
    ep0: &HostEndpoint,
    setup: &SetupPacket,
    data: Data<'_>,
    timeout_ms: u32,
) -> Result<usize> {
    let length = usize::from(setup.length);
    if setup.has_data() {
        let fits = match &data {
            Data::In(buf) => buf.len() >= length,
            Data::Out(buf) => buf.len() == length,
        };
        if data.direction() != setup.direction() || !fits {
            return Err(Error::Inval);
        }
    }
    trace!(
        "CONTROL dev {} {:x} {:x} {:x} {:x} {}",
        ep0.device_address,
        setup.request_type,
        setup.request,
        setup.value,
        setup.index,
        setup.length
    );

    let run = ControlRun::new(host, *ep0, setup);
    if let (Some(transfer), Data::Out(bytes)) = (&run.data, &data) {
        transfer.fill(bytes)?;
    }
    host.submit(ep0, &run.setup)?;

    if let Err(err) = run.done.wait(host.lib.os(), timeout_ms) {
        warn!(
            "control {:x} to device {} timed out after {} ms",
            setup.request, ep0.device_address, timeout_ms
        );
        if let Some(transfer) = run.current() {
            if let Err(cancel) = host.cancel(ep0, transfer) {
                warn!(
                    "control to device {} cancel: {:?}",
                    ep0.device_address, cancel
                );
            }
        }
        return Err(err);
    }

    let result = run.result.lock().take().unwrap_or(Err(Error::Fault));
    let actual = result?;
    match (data, &run.data) {
        (Data::In(buf), Some(transfer)) => Ok(transfer.read_into(&mut buf[..length])),
        _ => Ok(actual),
    }
}
