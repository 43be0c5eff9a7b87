//! Synchronous calls on top of asynchronous transfers
//!
//! Device and host pipes both implement [`TransferPipe`]. They supply the
//! asynchronous `submit` and `cancel`, and get a blocking
//! [`sync_call()`](TransferPipe::sync_call) with a timeout for free.

use crate::error::{Error, Result};
use crate::os::{Completion, Os, TimedMutex};
use crate::transfer::{Transfer, TransferStatus, TransferType};
use alloc::sync::Arc;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// Data for one synchronous call
pub enum Data<'a> {
    /// Receive into this buffer
    In(&'a mut [u8]),
    /// Send these bytes
    Out(&'a [u8]),
}

impl Data<'_> {
    pub(crate) fn direction(&self) -> UsbDirection {
        match self {
            Data::In(_) => UsbDirection::In,
            Data::Out(_) => UsbDirection::Out,
        }
    }
    pub(crate) fn len(&self) -> usize {
        match self {
            Data::In(buf) => buf.len(),
            Data::Out(buf) => buf.len(),
        }
    }
}

/// A pipe that can move data
pub trait TransferPipe {
    /// The pipe's endpoint address, including the direction
    fn endpoint(&self) -> EndpointAddress;

    fn transfer_type(&self) -> TransferType;

    fn os(&self) -> &dyn Os;

    /// Serializes synchronous calls on this pipe
    fn sync_lock(&self) -> &TimedMutex<()>;

    /// Bound on acquiring [`sync_lock()`](TransferPipe::sync_lock)
    fn lock_timeout(&self) -> u32 {
        crate::LOCK_TIMEOUT_MS
    }

    /// Buffer alignment the pipe's DMA mapper needs
    fn dma_align(&self) -> usize {
        1
    }

    /// Hand `transfer` to the hardware
    ///
    /// The transfer completes later through [`Transfer::complete()`]. If this
    /// returns an error, the transfer was never started and its callback
    /// won't run.
    fn submit(&self, transfer: &Arc<Transfer>) -> Result<()>;

    /// Ask the hardware to abandon `transfer`
    ///
    /// Best effort. If the hardware finished first, the transfer keeps its
    /// original result. Otherwise it completes with [`Error::Cancel`].
    fn cancel(&self, transfer: &Arc<Transfer>) -> Result<()>;

    /// Run one transfer to completion, waiting at most `timeout_ms`
    ///
    /// Returns the number of bytes transferred. On timeout the transfer is
    /// cancelled and the call returns [`Error::Time`]; a completion that
    /// arrives later is discarded. Only one synchronous call runs on a pipe
    /// at a time; others wait on the pipe lock.
    fn sync_call(&self, data: Data<'_>, timeout_ms: u32) -> Result<usize> {
        if data.direction() != self.endpoint().direction() {
            return Err(Error::Inval);
        }
        let _guard = self.sync_lock().lock(self.os(), self.lock_timeout())?;

        let done = Arc::new(Completion::new());
        let signal = Arc::clone(&done);
        let transfer = Transfer::builder(self.endpoint(), self.transfer_type())
            .capacity(data.len())
            .align(self.dma_align())
            .callback(move |transfer| {
                if !signal.signal() {
                    warn!(
                        "late completion on endpoint {} discarded",
                        u8::from(transfer.endpoint())
                    );
                }
            })
            .build();
        if let Data::Out(bytes) = &data {
            transfer.fill(bytes)?;
        }

        self.submit(&transfer)?;

        if let Err(err) = done.wait(self.os(), timeout_ms) {
            warn!(
                "endpoint {} timed out after {} ms",
                u8::from(self.endpoint()),
                timeout_ms
            );
            if let Err(cancel) = self.cancel(&transfer) {
                warn!(
                    "endpoint {} cancel: {:?}",
                    u8::from(self.endpoint()),
                    cancel
                );
            }
            return Err(err);
        }

        match transfer.status() {
            TransferStatus::Complete => match data {
                Data::In(buf) => Ok(transfer.read_into(buf)),
                Data::Out(_) => Ok(transfer.actual_length()),
            },
            TransferStatus::Failed(err) => Err(err),
            TransferStatus::Idle | TransferStatus::InProgress => Err(Error::Fault),
        }
    }

    /// Synchronously receive into `buf`
    fn read(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        self.sync_call(Data::In(buf), timeout_ms)
    }

    /// Synchronously send `buf`
    fn write(&self, buf: &[u8], timeout_ms: u32) -> Result<usize> {
        self.sync_call(Data::Out(buf), timeout_ms)
    }
}
