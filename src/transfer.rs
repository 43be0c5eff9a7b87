//! Transfer requests
//!
//! A [`Transfer`] describes one in-flight data transfer. The stack validates
//! and maps it, then hands it to the hardware driver. The driver calls
//! [`Transfer::complete()`] exactly once when the hardware finishes, or the
//! stack does it on the driver's behalf when the transfer is cancelled.
//!
//! ```text
//! Idle ──submit──▶ InProgress ──complete──▶ Complete | Failed(err)
//! ```
//!
//! Terminal transfers may be submitted again; an in-progress transfer may not.

use crate::dma::{align_up, DmaMapper};
use crate::error::{Error, Result};
use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use spin::Mutex;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// USB transfer types
///
/// Discriminants match the low bits of an endpoint's `bmAttributes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    /// Decode the transfer type from an endpoint's `bmAttributes`
    pub const fn from_attributes(attributes: u8) -> Self {
        match attributes & 0b11 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

bitflags::bitflags! {
    /// Per-transfer behavior flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransferFlags : u8 {
        /// Terminate an OUT transfer that's a multiple of the max packet
        /// size with a zero length packet
        const ZERO_PACKET = 1 << 0;
        /// Treat a short IN transfer as an error
        const SHORT_NOT_OK = 1 << 1;
        /// The transfer carries a SETUP token (host control transfers)
        const SETUP = 1 << 2;
    }
}

/// Transfer status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum TransferStatus {
    /// Never submitted
    Idle,
    /// Owned by the hardware driver
    InProgress,
    /// Finished successfully; see [`Transfer::actual_length()`]
    Complete,
    /// Finished with an error; [`Error::Cancel`] if it was cancelled
    Failed(Error),
}

/// One packet of an isochronous transfer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    /// Byte offset of the packet in the transfer buffer
    pub offset: usize,
    /// Requested packet length
    pub length: usize,
    /// Bytes actually transferred, set by the driver
    pub actual: usize,
    /// Packet error, set by the driver
    pub status: Option<Error>,
}

/// Completion callback
///
/// Runs in the context that completes the transfer, which is usually the
/// hardware driver's interrupt handler.
pub type Callback = Box<dyn Fn(&Transfer) + Send + Sync>;

struct Mapping {
    mapper: Arc<dyn DmaMapper>,
    addr: usize,
    len: usize,
}

/// One endpoint's bit in a shared set of halted endpoints
///
/// A submission carrying a flag raises it when the transfer completes with
/// a STALL ([`Error::Again`]).
#[derive(Clone)]
pub(crate) struct HaltFlag {
    bits: Arc<AtomicU32>,
    mask: u32,
}

impl HaltFlag {
    pub(crate) fn new(bits: Arc<AtomicU32>, endpoint: EndpointAddress) -> Self {
        let index = u8::from(endpoint) & 0x0F;
        let index = match endpoint.direction() {
            UsbDirection::In => index + 16,
            UsbDirection::Out => index,
        };
        Self {
            bits,
            mask: 1 << index,
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.bits.load(Ordering::Acquire) & self.mask != 0
    }

    pub(crate) fn set(&self) {
        self.bits.fetch_or(self.mask, Ordering::AcqRel);
    }

    pub(crate) fn clear(&self) {
        self.bits.fetch_and(!self.mask, Ordering::AcqRel);
    }
}

struct State {
    status: TransferStatus,
    mapping: Option<Mapping>,
    halt: Option<HaltFlag>,
}

/// Transfer memory, placed on `align` boundaries
///
/// The usable bytes start on an `align` boundary and the storage extends to
/// the next one past the end, so no other allocation shares their cache
/// lines.
struct Buffer {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
    align: usize,
}

impl Buffer {
    fn new(data: Vec<u8>, align: usize) -> Self {
        let align = align.max(1).next_power_of_two();
        if align == 1 {
            let len = data.len();
            return Self {
                storage: data,
                offset: 0,
                len,
                align,
            };
        }
        let len = data.len();
        let mut storage = vec![0; align_up(len, align) + align - 1];
        let addr = storage.as_ptr() as usize;
        let offset = align_up(addr, align) - addr;
        storage[offset..offset + len].copy_from_slice(&data);
        Self {
            storage,
            offset,
            len,
            align,
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}

/// A USB transfer request
pub struct Transfer {
    endpoint: EndpointAddress,
    kind: TransferType,
    flags: AtomicU8,
    buffer: Mutex<Buffer>,
    length: AtomicUsize,
    actual: AtomicUsize,
    start_frame: AtomicU32,
    iso: Mutex<Vec<IsoPacket>>,
    state: Mutex<State>,
    callback: Option<Callback>,
}

/// Builds a [`Transfer`]
pub struct TransferBuilder {
    endpoint: EndpointAddress,
    kind: TransferType,
    flags: TransferFlags,
    buffer: Vec<u8>,
    align: usize,
    length: Option<usize>,
    iso_packets: usize,
    callback: Option<Callback>,
}

impl TransferBuilder {
    /// Allocate a zeroed buffer of `capacity` bytes
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.buffer = vec![0; capacity];
        self
    }
    /// Use `buffer` as the transfer buffer
    pub fn buffer(mut self, buffer: Vec<u8>) -> Self {
        self.buffer = buffer;
        self
    }
    /// Place the buffer on `align` byte boundaries
    ///
    /// Pipes pass their DMA mapper's [`align()`](DmaMapper::align); a
    /// transfer whose buffer doesn't meet it fails to submit.
    pub fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }
    /// Request fewer bytes than the buffer holds
    pub fn length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }
    pub fn flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }
    /// Reserve `packets` isochronous packet descriptors
    pub fn iso_packets(mut self, packets: usize) -> Self {
        self.iso_packets = packets;
        self
    }
    pub fn callback(mut self, callback: impl Fn(&Transfer) + Send + Sync + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
    pub fn build(self) -> Arc<Transfer> {
        let length = self
            .length
            .unwrap_or(self.buffer.len())
            .min(self.buffer.len());
        Arc::new(Transfer {
            endpoint: self.endpoint,
            kind: self.kind,
            flags: AtomicU8::new(self.flags.bits()),
            buffer: Mutex::new(Buffer::new(self.buffer, self.align)),
            length: AtomicUsize::new(length),
            actual: AtomicUsize::new(0),
            start_frame: AtomicU32::new(0),
            iso: Mutex::new(vec![IsoPacket::default(); self.iso_packets]),
            state: Mutex::new(State {
                status: TransferStatus::Idle,
                mapping: None,
                halt: None,
            }),
            callback: self.callback,
        })
    }
}

/// Bytes per (micro)frame of an endpoint with this `wMaxPacketSize`
pub(crate) fn max_payload(max_packet_size: u16) -> usize {
    let transactions = usize::from((max_packet_size >> 11) & 0b11) + 1;
    usize::from(max_packet_size & 0x7FF) * transactions
}

impl Transfer {
    /// Start building a transfer for `endpoint`
    pub fn builder(endpoint: EndpointAddress, kind: TransferType) -> TransferBuilder {
        TransferBuilder {
            endpoint,
            kind,
            flags: TransferFlags::empty(),
            buffer: Vec::new(),
            align: 1,
            length: None,
            iso_packets: 0,
            callback: None,
        }
    }

    /// Returns the endpoint address, including the direction
    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }

    /// Returns the data direction
    pub fn direction(&self) -> UsbDirection {
        self.endpoint.direction()
    }

    pub fn transfer_type(&self) -> TransferType {
        self.kind
    }

    pub fn flags(&self) -> TransferFlags {
        TransferFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Change the flags for the next submission
    pub fn set_flags(&self, flags: TransferFlags) -> Result<()> {
        if self.is_in_progress() {
            return Err(Error::Busy);
        }
        self.flags.store(flags.bits(), Ordering::Release);
        Ok(())
    }

    /// Returns the number of bytes requested
    pub fn length(&self) -> usize {
        self.length.load(Ordering::Acquire)
    }

    /// Returns the buffer capacity
    pub fn capacity(&self) -> usize {
        self.buffer.lock().len
    }

    /// Change the number of bytes requested for the next submission
    ///
    /// Fails with [`Error::Busy`] while in progress, and with [`Error::Size`]
    /// if `length` exceeds the buffer capacity.
    pub fn set_length(&self, length: usize) -> Result<()> {
        let state = self.state.lock();
        if state.status == TransferStatus::InProgress {
            return Err(Error::Busy);
        }
        if length > self.capacity() {
            return Err(Error::Size);
        }
        self.length.store(length, Ordering::Release);
        Ok(())
    }

    /// Returns the number of bytes transferred by the last completion
    pub fn actual_length(&self) -> usize {
        self.actual.load(Ordering::Acquire)
    }

    pub fn status(&self) -> TransferStatus {
        self.state.lock().status
    }

    pub fn is_in_progress(&self) -> bool {
        self.status() == TransferStatus::InProgress
    }

    /// Returns the bus address of the mapped buffer while in progress
    pub fn dma_addr(&self) -> Option<usize> {
        self.state.lock().mapping.as_ref().map(|mapping| mapping.addr)
    }

    /// Isochronous transfers: first (micro)frame to schedule
    pub fn start_frame(&self) -> u32 {
        self.start_frame.load(Ordering::Acquire)
    }

    pub fn set_start_frame(&self, frame: u32) {
        self.start_frame.store(frame, Ordering::Release);
    }

    /// Access the whole transfer buffer
    ///
    /// Drivers use this to move data while the transfer is in progress.
    pub fn with_buffer<R>(&self, func: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut buffer = self.buffer.lock();
        func(buffer.bytes_mut())
    }

    /// Copy `data` to the start of the buffer, and request that many bytes
    pub fn fill(&self, data: &[u8]) -> Result<()> {
        if self.is_in_progress() {
            return Err(Error::Busy);
        }
        {
            let mut buffer = self.buffer.lock();
            let dst = buffer.bytes_mut().get_mut(..data.len()).ok_or(Error::Size)?;
            dst.copy_from_slice(data);
        }
        self.set_length(data.len())
    }

    /// Copy the transferred bytes into `dst`, returning the number copied
    pub fn read_into(&self, dst: &mut [u8]) -> usize {
        let buffer = self.buffer.lock();
        let bytes = buffer.bytes();
        let len = self.actual_length().min(dst.len()).min(bytes.len());
        dst[..len].copy_from_slice(&bytes[..len]);
        len
    }

    /// Access the isochronous packet descriptors
    pub fn with_iso_packets<R>(&self, func: impl FnOnce(&mut [IsoPacket]) -> R) -> R {
        let mut iso = self.iso.lock();
        func(&mut iso)
    }

    /// Check isochronous packet sizes against an endpoint's `wMaxPacketSize`
    ///
    /// Without packet descriptors the whole transfer is one packet.
    pub(crate) fn check_iso(&self, max_packet_size: u16) -> Result<()> {
        if self.kind != TransferType::Isochronous {
            return Ok(());
        }
        let limit = max_payload(max_packet_size);
        let iso = self.iso.lock();
        let too_long = if iso.is_empty() {
            self.length() > limit
        } else {
            iso.iter().any(|packet| packet.length > limit)
        };
        if too_long {
            return Err(Error::Size);
        }
        Ok(())
    }

    /// Mark the transfer in progress and map its buffer
    ///
    /// Fails with [`Error::Busy`] if it's already in progress, and with
    /// [`Error::Inval`] if the buffer isn't placed on the mapper's alignment.
    pub(crate) fn begin(&self, mapper: &Arc<dyn DmaMapper>) -> Result<()> {
        self.begin_halting(mapper, None)
    }

    /// [`begin()`](Transfer::begin), raising `halt` if this submission stalls
    pub(crate) fn begin_halting(
        &self,
        mapper: &Arc<dyn DmaMapper>,
        halt: Option<&HaltFlag>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.status == TransferStatus::InProgress {
            return Err(Error::Busy);
        }
        let len = self.length();
        let addr = {
            let mut buffer = self.buffer.lock();
            let align = mapper.align();
            let start = buffer.bytes().as_ptr() as usize;
            if align > 1 && len > 0 && (buffer.align < align || start % align != 0) {
                warn!(
                    "endpoint {} buffer {:x} not on a {} byte boundary",
                    u8::from(self.endpoint),
                    start,
                    align
                );
                return Err(Error::Inval);
            }
            mapper.map(&mut buffer.bytes_mut()[..len], self.direction())?
        };
        state.mapping = Some(Mapping {
            mapper: Arc::clone(mapper),
            addr,
            len,
        });
        state.halt = halt.cloned();
        state.status = TransferStatus::InProgress;
        self.actual.store(0, Ordering::Release);
        Ok(())
    }

    /// Undo [`begin()`](Transfer::begin) after the driver rejected the transfer
    ///
    /// The callback doesn't run; the submitter sees the error directly.
    pub(crate) fn abort(&self, err: Error) {
        let mapping = {
            let mut state = self.state.lock();
            state.status = TransferStatus::Failed(err);
            state.halt = None;
            state.mapping.take()
        };
        self.unmap(mapping);
    }

    fn unmap(&self, mapping: Option<Mapping>) {
        if let Some(Mapping { mapper, addr, len }) = mapping {
            let mut buffer = self.buffer.lock();
            mapper.unmap(addr, &mut buffer.bytes_mut()[..len], self.direction());
        }
    }

    /// Complete the transfer
    ///
    /// Drivers call this once the hardware is done. `result` carries the
    /// number of bytes transferred, or the transfer error. Only the first
    /// completion of a submission takes effect; later calls return `false`
    /// and don't run the callback.
    pub fn complete(&self, result: Result<usize>) -> bool {
        let mapping = {
            let mut state = self.state.lock();
            if state.status != TransferStatus::InProgress {
                return false;
            }
            match result {
                Ok(actual) => {
                    self.actual
                        .store(actual.min(self.length()), Ordering::Release);
                    state.status = TransferStatus::Complete;
                }
                Err(err) => state.status = TransferStatus::Failed(err),
            }
            if let (Some(halt), Err(Error::Again)) = (state.halt.take(), result) {
                halt.set();
            }
            state.mapping.take()
        };
        self.unmap(mapping);
        if let Some(callback) = &self.callback {
            callback(self);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{HaltFlag, Transfer, TransferStatus, TransferType};
    use crate::{dma::Coherent, dma::DmaMapper, testing, Error};
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use usb_device::endpoint::EndpointAddress;

    fn mapper() -> Arc<dyn DmaMapper> {
        Arc::new(Coherent)
    }

    #[test]
    fn lifecycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let transfer = Transfer::builder(EndpointAddress::from(0x81), TransferType::Bulk)
            .capacity(64)
            .callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        assert_eq!(transfer.status(), TransferStatus::Idle);
        assert_eq!(transfer.length(), 64);

        transfer.begin(&mapper()).unwrap();
        assert!(transfer.dma_addr().is_some());
        assert_eq!(transfer.begin(&mapper()), Err(Error::Busy));
        assert_eq!(transfer.set_length(8), Err(Error::Busy));

        assert!(transfer.complete(Ok(13)));
        assert!(!transfer.complete(Err(Error::Cancel)));
        assert_eq!(transfer.status(), TransferStatus::Complete);
        assert_eq!(transfer.actual_length(), 13);
        assert!(transfer.dma_addr().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Terminal transfers may be resubmitted.
        transfer.begin(&mapper()).unwrap();
        assert!(transfer.complete(Err(Error::Cancel)));
        assert_eq!(transfer.status(), TransferStatus::Failed(Error::Cancel));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn abort_skips_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let transfer = Transfer::builder(EndpointAddress::from(0x02), TransferType::Bulk)
            .capacity(8)
            .callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        transfer.begin(&mapper()).unwrap();
        transfer.abort(Error::NoDev);
        assert_eq!(transfer.status(), TransferStatus::Failed(Error::NoDev));
        assert!(!transfer.complete(Ok(8)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fill_and_read() {
        let transfer = Transfer::builder(EndpointAddress::from(0x01), TransferType::Bulk)
            .capacity(4)
            .build();
        assert_eq!(transfer.fill(&[1, 2, 3, 4, 5]), Err(Error::Size));
        transfer.fill(&[9, 8]).unwrap();
        assert_eq!(transfer.length(), 2);
        transfer.begin(&mapper()).unwrap();
        transfer.complete(Ok(100));
        // Clamped to the requested length.
        assert_eq!(transfer.actual_length(), 2);
        let mut dst = [0; 4];
        assert_eq!(transfer.read_into(&mut dst), 2);
        assert_eq!(dst, [9, 8, 0, 0]);
    }

    #[test]
    fn stall_raises_the_halt_flag() {
        let bits = Arc::new(AtomicU32::new(0));
        let halt = HaltFlag::new(Arc::clone(&bits), EndpointAddress::from(0x81));
        let other = HaltFlag::new(Arc::clone(&bits), EndpointAddress::from(0x01));
        let transfer = Transfer::builder(EndpointAddress::from(0x81), TransferType::Bulk)
            .capacity(8)
            .build();

        transfer.begin_halting(&mapper(), Some(&halt)).unwrap();
        transfer.complete(Err(Error::Proto));
        assert!(!halt.is_set());

        transfer.begin_halting(&mapper(), Some(&halt)).unwrap();
        transfer.complete(Err(Error::Again));
        assert!(halt.is_set());
        assert!(!other.is_set());
        assert_eq!(bits.load(Ordering::SeqCst), 1 << 17);

        halt.clear();
        // Plain submissions never touch the flag.
        transfer.begin(&mapper()).unwrap();
        transfer.complete(Err(Error::Again));
        assert!(!halt.is_set());
    }

    #[test]
    fn buffers_follow_the_mapper_alignment() {
        let lines: Arc<dyn DmaMapper> = Arc::new(testing::CacheLines);
        let loose = Transfer::builder(EndpointAddress::from(0x81), TransferType::Bulk)
            .capacity(24)
            .build();
        assert_eq!(loose.begin(&lines), Err(Error::Inval));
        assert_eq!(loose.status(), TransferStatus::Idle);

        let placed = Transfer::builder(EndpointAddress::from(0x02), TransferType::Bulk)
            .buffer(alloc::vec![7; 24])
            .align(32)
            .build();
        assert_eq!(placed.capacity(), 24);
        placed.begin(&lines).unwrap();
        assert_eq!(placed.dma_addr().unwrap() % 32, 0);
        placed.with_buffer(|buf| assert_eq!(buf, &[7; 24]));
        assert!(placed.complete(Ok(24)));

        // Zero length transfers map nothing.
        let status = Transfer::builder(EndpointAddress::from(0x80), TransferType::Control).build();
        status.begin(&lines).unwrap();
    }
}
