//! Isochronous audio endpoint engine

use super::pcm::Substream;
use crate::descriptor::EndpointDescriptor;
use crate::error::{Error, Result};
use crate::host::HostPipe;
use crate::pipe::TransferPipe;
use crate::transfer::{max_payload, Transfer, TransferStatus, TransferType};
use crate::Speed;
use alloc::{
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// (Micro)frames between reading the frame counter and the first packet
const START_DELAY_FRAMES: u32 = 4;

/// Packet sizing state, in Q16.16 frames per packet interval
#[derive(Debug, Clone)]
pub(crate) struct RateState {
    /// Nominal rate
    freqn: u32,
    /// Current rate, moved by feedback
    freqm: u32,
    /// Highest rate the endpoint's packet size allows
    freqmax: u32,
    phase: u32,
    /// log2 of (micro)frames per packet
    datainterval: u8,
    /// Frames per packet cap
    maxframesize: u32,
    /// Always send `maxframesize` frames
    fill_max: bool,
    speed: Speed,
}

impl RateState {
    pub(crate) fn new(
        rate: u32,
        speed: Speed,
        descriptor: &EndpointDescriptor,
        frame_bytes: usize,
        fill_max: bool,
    ) -> Result<Self> {
        if rate == 0 || frame_bytes == 0 {
            return Err(Error::Inval);
        }
        let rate = u64::from(rate);
        // Q16.16 frames per frame (full speed) or per microframe
        let freqn = match speed {
            Speed::High => ((rate << 10) + 62) / 125,
            Speed::Full | Speed::Low => ((rate << 13) + 62) / 125,
        };
        let freqn = u32::try_from(freqn).map_err(|_| Error::Inval)?;
        let datainterval = match speed {
            Speed::High => descriptor.interval.saturating_sub(1).min(3),
            Speed::Full | Speed::Low => 0,
        };
        let frame_bytes = frame_bytes as u32;
        let maxpacksize = max_payload(descriptor.max_packet_size) as u32;

        let mut freqmax = freqn + (freqn >> 1);
        let mut maxsize =
            (((u64::from(freqmax) << datainterval) + 0xFFFF) >> 16) * u64::from(frame_bytes);
        if maxpacksize != 0 && u64::from(maxpacksize) < maxsize {
            maxsize = u64::from(maxpacksize);
            freqmax = (maxpacksize / frame_bytes) << (16 - datainterval);
        }
        let maxframesize = (maxsize / u64::from(frame_bytes)) as u32;
        if maxframesize == 0 {
            return Err(Error::Size);
        }
        Ok(Self {
            freqn,
            freqm: freqn,
            freqmax,
            phase: 0,
            datainterval,
            maxframesize,
            fill_max,
            speed,
        })
    }

    /// Frames in the next packet
    pub(crate) fn next_packet_size(&mut self) -> u32 {
        if self.fill_max {
            return self.maxframesize;
        }
        self.phase = (self.phase & 0xFFFF) + (self.freqm << self.datainterval);
        (self.phase >> 16).min(self.maxframesize)
    }

    /// (Micro)frames each packet spans
    fn packet_interval(&self) -> u32 {
        1 << self.datainterval
    }

    /// Take a feedback value from the device
    ///
    /// Full speed devices send 10.14 fixed point frames per frame in three
    /// bytes; high speed devices send 16.16 frames per microframe in four.
    pub(crate) fn feedback(&mut self, bytes: &[u8]) -> Result<()> {
        let value = match (self.speed, bytes) {
            (Speed::High, [a, b, c, d]) => u32::from_le_bytes([*a, *b, *c, *d]),
            (Speed::Full | Speed::Low, [a, b, c]) => u32::from_le_bytes([*a, *b, *c, 0]) << 2,
            _ => return Err(Error::Inval),
        };
        let low = self.freqn - self.freqn / 8;
        if value < low || value > self.freqmax {
            debug!("feedback {:x} outside {:x}..={:x}", value, low, self.freqmax);
            return Err(Error::Inval);
        }
        self.freqm = value;
        Ok(())
    }
}

/// Engine tuning
#[derive(Debug, Clone, Copy)]
pub struct EndpointOptions {
    /// Transfers kept in flight
    pub transfers: usize,
    /// Packets per transfer
    pub packets: usize,
    /// Send full packets regardless of the rate
    pub fill_max: bool,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            transfers: 4,
            packets: 8,
            fill_max: false,
        }
    }
}

struct EndpointInner {
    pipe: HostPipe,
    substream: Arc<Substream>,
    rate: Mutex<RateState>,
    frame_bytes: usize,
    packets: usize,
    transfers: Vec<Arc<Transfer>>,
    use_count: Mutex<u32>,
    /// Held while a completion resubmits, so stopping can't miss one
    running: Mutex<bool>,
    /// (Micro)frame the next submitted transfer starts on
    next_frame: AtomicU32,
    /// Playback frames handed to the device and not yet sent
    last_delay: AtomicU32,
}

impl EndpointInner {
    fn is_playback(&self) -> bool {
        self.substream.direction() == usb_device::UsbDirection::Out
    }

    /// Lay out the packets of `transfer` and, for playback, fill it
    fn prepare(&self, transfer: &Transfer) -> Result<()> {
        let frame_bytes = self.frame_bytes;
        let mut rate = self.rate.lock();
        let mut offset = 0;
        transfer.with_iso_packets(|packets| {
            for packet in packets.iter_mut() {
                let frames = match self.is_playback() {
                    true => rate.next_packet_size() as usize,
                    false => rate.maxframesize as usize,
                };
                packet.offset = offset;
                packet.length = frames * frame_bytes;
                packet.actual = 0;
                packet.status = None;
                offset += packet.length;
            }
        });
        let span = rate.packet_interval() * self.packets as u32;
        drop(rate);
        transfer.set_length(offset)?;
        let start = self.next_frame.fetch_add(span, Ordering::AcqRel);
        transfer.set_start_frame(start);

        if self.is_playback() {
            transfer.with_buffer(|buf| self.substream.pull(&mut buf[..offset]));
            self.last_delay
                .fetch_add((offset / frame_bytes) as u32, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Runs from each transfer's completion
    fn retire(&self, transfer: &Transfer) {
        match transfer.status() {
            TransferStatus::Complete => {}
            TransferStatus::Failed(Error::Cancel) => return,
            TransferStatus::Failed(err) => warn!(
                "EP {:x} iso transfer failed: {:?}",
                u8::from(self.pipe.endpoint()),
                err
            ),
            TransferStatus::Idle | TransferStatus::InProgress => return,
        }
        if self.is_playback() {
            let sent = (transfer.actual_length() / self.frame_bytes) as u32;
            let _ = self
                .last_delay
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |delay| {
                    Some(delay.saturating_sub(sent))
                });
        } else {
            transfer.with_iso_packets(|packets| {
                transfer.with_buffer(|buf| {
                    for packet in packets.iter().filter(|packet| packet.status.is_none()) {
                        let end = (packet.offset + packet.actual).min(buf.len());
                        self.substream.push(&buf[packet.offset.min(end)..end]);
                    }
                })
            });
        }
        let running = self.running.lock();
        // A restart may already have taken the transfer back
        if !*running || transfer.is_in_progress() {
            return;
        }
        if let Err(err) = self.resubmit(transfer) {
            error!(
                "EP {:x} resubmit failed: {:?}",
                u8::from(self.pipe.endpoint()),
                err
            );
        }
        drop(running);
    }

    fn resubmit(&self, transfer: &Transfer) -> Result<()> {
        let transfer = self
            .transfers
            .iter()
            .find(|candidate| core::ptr::eq(&***candidate, transfer))
            .ok_or(Error::Fault)?;
        self.prepare(transfer)?;
        self.pipe.submit(transfer)
    }

    fn cancel_all(&self) {
        for transfer in &self.transfers {
            if let Err(err) = self.pipe.cancel(transfer) {
                warn!("iso cancel: {:?}", err);
            }
        }
    }
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        let running = core::mem::replace(&mut *self.running.lock(), false);
        if running {
            self.cancel_all();
        }
    }
}

/// Moves a PCM [`Substream`] over an isochronous pipe
///
/// Playback endpoints size each packet from the rate accumulator and fill
/// it from the ring, or with silence when the ring runs dry. Capture
/// endpoints ask for full packets and append what arrives to the ring.
/// [`start()`](UacEndpoint::start) and [`stop()`](UacEndpoint::stop) nest;
/// only the first start submits transfers and only the last stop cancels
/// them.
pub struct UacEndpoint {
    inner: Arc<EndpointInner>,
}

impl UacEndpoint {
    /// Set up the engine for `substream` on an isochronous `pipe`
    ///
    /// Fails with [`Error::Inval`] if the pipe isn't isochronous, if its
    /// direction doesn't match the substream, or if the options ask for no
    /// transfers or packets.
    pub fn new(pipe: HostPipe, substream: Arc<Substream>, options: EndpointOptions) -> Result<Self> {
        if pipe.transfer_type() != TransferType::Isochronous
            || pipe.endpoint().direction() != substream.direction()
            || options.transfers == 0
            || options.packets == 0
        {
            return Err(Error::Inval);
        }
        let params = *substream.params();
        let frame_bytes = params.frame_bytes();
        let ep = *pipe.host_endpoint();
        let rate = RateState::new(
            params.rate,
            ep.speed,
            &ep.descriptor,
            frame_bytes,
            options.fill_max,
        )?;
        let capacity = rate.maxframesize as usize * frame_bytes * options.packets;
        debug!(
            "UAC EP {:x} rate {} freqn {:x} max {} frames",
            ep.descriptor.address, params.rate, rate.freqn, rate.maxframesize
        );

        let inner = Arc::new_cyclic(|weak: &Weak<EndpointInner>| {
            let transfers = (0..options.transfers)
                .map(|_| {
                    let weak = Weak::clone(weak);
                    Transfer::builder(pipe.endpoint(), TransferType::Isochronous)
                        .capacity(capacity)
                        .align(pipe.dma_align())
                        .iso_packets(options.packets)
                        .callback(move |transfer| {
                            if let Some(inner) = weak.upgrade() {
                                inner.retire(transfer);
                            }
                        })
                        .build()
                })
                .collect();
            EndpointInner {
                pipe,
                substream,
                rate: Mutex::new(rate),
                frame_bytes,
                packets: options.packets,
                transfers,
                use_count: Mutex::new(0),
                running: Mutex::new(false),
                next_frame: AtomicU32::new(0),
                last_delay: AtomicU32::new(0),
            }
        });
        Ok(Self { inner })
    }

    pub fn substream(&self) -> &Arc<Substream> {
        &self.inner.substream
    }

    /// Start streaming, or count one more user of a running stream
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut use_count = inner.use_count.lock();
        if *use_count > 0 {
            *use_count += 1;
            return Ok(());
        }
        let frame = inner.pipe.frame_number()?;
        inner
            .next_frame
            .store(frame.wrapping_add(START_DELAY_FRAMES), Ordering::Release);
        inner.rate.lock().phase = 0;
        inner.last_delay.store(0, Ordering::Release);

        let mut running = inner.running.lock();
        *running = true;
        for transfer in &inner.transfers {
            let result = inner
                .prepare(transfer)
                .and_then(|_| inner.pipe.submit(transfer));
            if let Err(err) = result {
                warn!("UAC start: {:?}", err);
                *running = false;
                drop(running);
                inner.cancel_all();
                return Err(err);
            }
        }
        drop(running);
        *use_count = 1;
        info!(
            "UAC EP {:x} START frame {}",
            u8::from(inner.pipe.endpoint()),
            frame
        );
        Ok(())
    }

    /// Drop one user; the last one stops the stream
    ///
    /// Fails with [`Error::Perm`] if the stream isn't running.
    pub fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let mut use_count = inner.use_count.lock();
        match *use_count {
            0 => Err(Error::Perm),
            1 => {
                *use_count = 0;
                // Completions that already passed the check have resubmitted
                // by the time the lock is free, so the cancels below see them.
                *inner.running.lock() = false;
                inner.cancel_all();
                info!("UAC EP {:x} STOP", u8::from(inner.pipe.endpoint()));
                Ok(())
            }
            _ => {
                *use_count -= 1;
                Ok(())
            }
        }
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.lock()
    }

    /// Playback frames queued to the device but not yet sent
    pub fn delay(&self) -> u32 {
        self.inner.last_delay.load(Ordering::Acquire)
    }

    /// Apply a feedback value read from the device's feedback endpoint
    ///
    /// Values more than an eighth below the nominal rate, or above what the
    /// packet size allows, fail with [`Error::Inval`] and leave the rate
    /// unchanged.
    pub fn feedback(&self, bytes: &[u8]) -> Result<()> {
        self.inner.rate.lock().feedback(bytes)
    }

    /// The current rate, Q16.16 frames per (micro)frame
    pub fn rate(&self) -> u32 {
        self.inner.rate.lock().freqm
    }
}

#[cfg(test)]
mod tests {
    use super::{EndpointOptions, RateState, UacEndpoint};
    use crate::descriptor::EndpointDescriptor;
    use crate::host::uac::{PcmFormat, PcmParams, Substream};
    use crate::testing::{self, HostEvent};
    use crate::{Error, Speed};
    use alloc::{sync::Arc, vec::Vec};

    fn iso(max_packet_size: u16, interval: u8) -> EndpointDescriptor {
        EndpointDescriptor {
            address: 0x04,
            attributes: 0x09,
            max_packet_size,
            interval,
        }
    }

    #[test]
    fn cd_rate_at_full_speed() {
        let mut rate = RateState::new(44_100, Speed::Full, &iso(192, 1), 4, false).unwrap();
        assert_eq!(rate.freqn, 2_890_138);
        assert_eq!(rate.maxframesize, 48);
        let total: u64 = (0..65_536).map(|_| u64::from(rate.next_packet_size())).sum();
        // 44.1 frames per millisecond for 65536 milliseconds
        assert!(total.abs_diff(2_890_138) <= 1);
    }

    #[test]
    fn accumulator_does_not_drift() {
        for speed in [Speed::Full, Speed::High] {
            for rate_hz in [8_000, 11_025, 22_050, 44_100, 48_000, 88_200, 96_000, 192_000] {
                let mut rate = RateState::new(rate_hz, speed, &iso(1023, 1), 4, false).unwrap();
                let per_second = match speed {
                    Speed::High => 8_000,
                    _ => 1_000,
                };
                let total: u64 = (0..65_536).map(|_| u64::from(rate.next_packet_size())).sum();
                let exact = u64::from(rate_hz) * 65_536 / per_second;
                assert!(
                    total.abs_diff(exact) <= 1,
                    "{} Hz: {} vs {}",
                    rate_hz,
                    total,
                    exact
                );
            }
        }
    }

    #[test]
    fn packet_size_caps() {
        // 48 kHz stereo 16 bit needs 192 bytes per frame; 100 bytes fit 25 frames
        let mut rate = RateState::new(48_000, Speed::Full, &iso(100, 1), 4, false).unwrap();
        assert_eq!(rate.maxframesize, 25);
        assert!((0..100).all(|_| rate.next_packet_size() == 25));

        let mut full = RateState::new(44_100, Speed::Full, &iso(192, 1), 4, true).unwrap();
        assert!((0..10).all(|_| full.next_packet_size() == 48));

        // Too small for a single frame
        assert!(RateState::new(48_000, Speed::Full, &iso(2, 1), 4, false).is_err());
    }

    #[test]
    fn high_speed_interval() {
        // bInterval 4: one packet every 8 microframes
        let mut rate = RateState::new(48_000, Speed::High, &iso(1023, 4), 4, false).unwrap();
        assert_eq!(rate.datainterval, 3);
        assert!((0..16).all(|_| rate.next_packet_size() == 48));
        let rate = RateState::new(48_000, Speed::High, &iso(1023, 9), 4, false).unwrap();
        assert_eq!(rate.datainterval, 3);
    }

    #[test]
    fn feedback_formats() {
        let mut full = RateState::new(44_100, Speed::Full, &iso(192, 1), 4, false).unwrap();
        // 44.1 in 10.14
        let value: u32 = 722_534;
        full.feedback(&value.to_le_bytes()[..3]).unwrap();
        assert_eq!(full.freqm, value << 2);
        // 30 frames per frame is too slow
        let slow: u32 = 30 << 14;
        assert_eq!(full.feedback(&slow.to_le_bytes()[..3]), Err(Error::Inval));
        assert_eq!(full.feedback(&value.to_le_bytes()), Err(Error::Inval));
        assert_eq!(full.freqm, value << 2);

        let mut high = RateState::new(44_100, Speed::High, &iso(192, 1), 4, false).unwrap();
        let value: u32 = 5 << 16 | 0x8000;
        high.feedback(&value.to_le_bytes()).unwrap();
        assert_eq!(high.freqm, value);
        let fast: u32 = 12 << 16;
        assert_eq!(high.feedback(&fast.to_le_bytes()), Err(Error::Inval));
    }

    fn params(rate: u32) -> PcmParams {
        PcmParams {
            format: PcmFormat::S16Le,
            channels: 2,
            rate,
            period_bytes: 48 * 4,
            periods: 4,
        }
    }

    #[test]
    fn playback_streams_until_stopped() {
        let fixture = testing::host();
        fixture.driver.plug();
        let device = fixture.host.port_connected(0, Speed::Full).unwrap();
        device.set_interface(2, 1).unwrap();
        fixture.driver.set_frame(100);

        let substream = Arc::new(Substream::playback(params(48_000)).unwrap());
        assert_eq!(substream.write(&[1; 48 * 4 * 2]), 48 * 4 * 2);
        let options = EndpointOptions {
            transfers: 2,
            packets: 2,
            fill_max: false,
        };
        let endpoint =
            UacEndpoint::new(device.pipe_open(0x04).unwrap(), substream.clone(), options)
                .unwrap();
        assert_eq!(endpoint.stop(), Err(Error::Perm));
        endpoint.start().unwrap();
        endpoint.start().unwrap();

        // Two transfers of two 1 ms packets at 48 frames each, scheduled
        // ahead of the frame counter
        let first = fixture.driver.take(0x04).unwrap();
        let second = fixture.driver.take(0x04).unwrap();
        assert_eq!(first.length(), 2 * 48 * 4);
        assert_eq!(first.start_frame(), 104);
        assert_eq!(second.start_frame(), 106);
        first.with_iso_packets(|packets| {
            assert_eq!(packets[1].offset, 48 * 4);
            assert_eq!(packets[1].length, 48 * 4);
        });
        first.with_buffer(|buf| assert_eq!(buf[0], 1));
        assert_eq!(endpoint.delay(), 4 * 48);
        assert_eq!(substream.periods_elapsed(), 2);

        // Completing one resubmits it with the next frames
        first.complete(Ok(first.length()));
        let again = fixture.driver.take(0x04).unwrap();
        assert!(Arc::ptr_eq(&again, &first));
        assert_eq!(again.start_frame(), 108);
        // Out of data: silence
        again.with_buffer(|buf| assert_eq!(buf[0], 0));
        assert_eq!(endpoint.delay(), 4 * 48);

        endpoint.stop().unwrap();
        assert!(endpoint.is_running());
        endpoint.stop().unwrap();
        assert!(!endpoint.is_running());
        assert!(fixture
            .driver
            .events()
            .contains(&HostEvent::Cancel(device.address(), 0x04)));
        assert!(fixture.driver.take(0x04).is_none());
    }

    #[test]
    fn stop_races_completions() {
        let fixture = testing::host();
        fixture.driver.plug();
        let device = fixture.host.port_connected(0, Speed::Full).unwrap();
        device.set_interface(2, 1).unwrap();
        let substream = Arc::new(Substream::playback(params(48_000)).unwrap());
        let options = EndpointOptions {
            transfers: 2,
            packets: 1,
            fill_max: false,
        };
        let endpoint =
            UacEndpoint::new(device.pipe_open(0x04).unwrap(), substream, options).unwrap();

        for _ in 0..50 {
            endpoint.start().unwrap();
            let taken: Vec<_> = core::iter::from_fn(|| fixture.driver.take(0x04)).collect();
            assert_eq!(taken.len(), 2);
            let hardware = std::thread::spawn(move || {
                for transfer in taken {
                    transfer.complete(Ok(transfer.length()));
                }
            });
            endpoint.stop().unwrap();
            hardware.join().unwrap();

            // Nothing may stay queued past the last stop
            assert!(endpoint
                .inner
                .transfers
                .iter()
                .all(|transfer| !transfer.is_in_progress()));
            while fixture.driver.take(0x04).is_some() {}
        }
    }

    #[test]
    fn capture_fills_the_ring() {
        let fixture = testing::host();
        let device = fixture.attach();
        device.set_interface(1, 1).unwrap();
        let substream = Arc::new(Substream::capture(params(44_100)).unwrap());
        let options = EndpointOptions {
            transfers: 1,
            packets: 2,
            fill_max: false,
        };
        let endpoint =
            UacEndpoint::new(device.pipe_open(0x83).unwrap(), substream.clone(), options)
                .unwrap();
        endpoint.start().unwrap();

        let transfer = fixture.driver.take(0x83).unwrap();
        let packet = transfer.with_iso_packets(|packets| packets[0].length);
        // High speed, 5.5 frames per microframe: 9 frame packets
        assert_eq!(packet, 9 * 4);
        transfer.with_iso_packets(|packets| {
            packets[0].actual = 6 * 4;
            packets[1].actual = 5 * 4;
        });
        transfer.with_buffer(|buf| buf.fill(7));
        transfer.complete(Ok(11 * 4));

        let mut data = [0; 64];
        assert_eq!(substream.read(&mut data), 11 * 4);
        assert!(data[..11 * 4].iter().all(|byte| *byte == 7));
        endpoint.stop().unwrap();
    }

    #[test]
    fn pipe_must_match_the_substream() {
        let fixture = testing::host();
        let device = fixture.attach();
        device.set_interface(1, 1).unwrap();
        let playback = Arc::new(Substream::playback(params(44_100)).unwrap());
        let pipe = device.pipe_open(0x83).unwrap();
        assert_eq!(
            UacEndpoint::new(pipe, playback, EndpointOptions::default()).err(),
            Some(Error::Inval)
        );
        let capture = Arc::new(Substream::capture(params(44_100)).unwrap());
        let bulk = device.pipe_open(0x81).unwrap();
        assert_eq!(
            UacEndpoint::new(bulk, capture, EndpointOptions::default()).err(),
            Some(Error::Inval)
        );
    }
}
