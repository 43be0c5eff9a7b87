//! PCM formats and the sample ring

use crate::error::{Error, Result};
use alloc::{boxed::Box, vec, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use usb_device::UsbDirection;

/// Sample layouts of Type I audio data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum PcmFormat {
    S8,
    U8,
    S16Le,
    S16Be,
    U16Le,
    U16Be,
    /// 24 bits in 3 bytes
    S24_3Le,
    S24_3Be,
    U24_3Le,
    U24_3Be,
    /// 24 bits in the low bytes of 4
    S24Le,
    S32Le,
    S32Be,
    U32Le,
    U32Be,
    FloatLe,
}

impl PcmFormat {
    /// Bytes per sample of one channel
    pub const fn sample_bytes(self) -> usize {
        match self {
            PcmFormat::S8 | PcmFormat::U8 => 1,
            PcmFormat::S16Le | PcmFormat::S16Be | PcmFormat::U16Le | PcmFormat::U16Be => 2,
            PcmFormat::S24_3Le | PcmFormat::S24_3Be | PcmFormat::U24_3Le | PcmFormat::U24_3Be => 3,
            PcmFormat::S24Le
            | PcmFormat::S32Le
            | PcmFormat::S32Be
            | PcmFormat::U32Le
            | PcmFormat::U32Be
            | PcmFormat::FloatLe => 4,
        }
    }

    /// One sample of silence
    ///
    /// Zero for signed and float formats; unsigned formats center on the
    /// top bit of the most significant byte.
    pub const fn silence(self) -> &'static [u8] {
        match self {
            PcmFormat::U8 => &[0x80],
            PcmFormat::U16Le => &[0x00, 0x80],
            PcmFormat::U16Be => &[0x80, 0x00],
            PcmFormat::U24_3Le => &[0x00, 0x00, 0x80],
            PcmFormat::U24_3Be => &[0x80, 0x00, 0x00],
            PcmFormat::U32Le => &[0x00, 0x00, 0x00, 0x80],
            PcmFormat::U32Be => &[0x80, 0x00, 0x00, 0x00],
            PcmFormat::S8 => &[0],
            PcmFormat::S16Le | PcmFormat::S16Be => &[0; 2],
            PcmFormat::S24_3Le | PcmFormat::S24_3Be => &[0; 3],
            PcmFormat::S24Le
            | PcmFormat::S32Le
            | PcmFormat::S32Be
            | PcmFormat::FloatLe => &[0; 4],
        }
    }

    /// Fill `buf` with silence, starting on a sample boundary
    pub fn fill_silence(self, buf: &mut [u8]) {
        let pattern = self.silence();
        for (byte, silence) in buf.iter_mut().zip(pattern.iter().cycle()) {
            *byte = *silence;
        }
    }

    /// The signed little endian format of a Type I subframe
    pub fn from_subframe(subframe_size: u8, bit_resolution: u8) -> Option<Self> {
        match (subframe_size, bit_resolution) {
            (1, 1..=8) => Some(PcmFormat::S8),
            (2, 9..=16) => Some(PcmFormat::S16Le),
            (3, 17..=24) => Some(PcmFormat::S24_3Le),
            (4, 17..=24) => Some(PcmFormat::S24Le),
            (4, 25..=32) => Some(PcmFormat::S32Le),
            _ => None,
        }
    }
}

/// Stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmParams {
    pub format: PcmFormat,
    pub channels: u8,
    /// Frames per second
    pub rate: u32,
    /// Bytes between period-elapsed notifications
    pub period_bytes: usize,
    /// Periods in the ring
    pub periods: usize,
}

/// Highest channel count of one stream
pub const CHANNELS_MAX: u8 = 32;
pub const RATE_MAX: u32 = 768_000;

impl PcmParams {
    /// Bytes per frame, one sample of every channel
    pub fn frame_bytes(&self) -> usize {
        self.format.sample_bytes() * usize::from(self.channels)
    }

    pub fn period_frames(&self) -> usize {
        self.period_bytes / self.frame_bytes()
    }

    pub fn buffer_frames(&self) -> usize {
        self.period_frames() * self.periods
    }

    /// Fails with [`Error::Inval`] unless the periods hold whole frames and
    /// the ring holds at least two of them
    pub fn validate(&self) -> Result<()> {
        let valid = (1..=CHANNELS_MAX).contains(&self.channels)
            && (1..=RATE_MAX).contains(&self.rate)
            && self.period_bytes != 0
            && self.period_bytes % self.frame_bytes() == 0
            && self.periods >= 2;
        if !valid {
            warn!(
                "PCM params rejected: {} ch {} Hz period {} x {}",
                self.channels, self.rate, self.period_bytes, self.periods
            );
            return Err(Error::Inval);
        }
        Ok(())
    }
}

/// Runs when the hardware pointer crosses a period boundary
pub type PeriodCallback = Box<dyn Fn(&Substream) + Send + Sync>;

struct Ring {
    buffer: Vec<u8>,
    /// Frames the endpoint has consumed or produced
    hw: u64,
    /// Frames the application has written or read
    appl: u64,
    /// Frames since the last period boundary
    period_done: usize,
}

/// A PCM ring between the application and a [`UacEndpoint`](super::UacEndpoint)
///
/// Pointers count frames since the stream was created and never wrap; the
/// ring position is the pointer modulo the buffer size. For playback the
/// application writes ahead of the hardware pointer; for capture the
/// hardware pointer runs ahead of the application.
pub struct Substream {
    direction: UsbDirection,
    params: PcmParams,
    ring: Mutex<Ring>,
    on_period: Option<PeriodCallback>,
    periods_elapsed: AtomicU64,
}

impl Substream {
    fn new(direction: UsbDirection, params: PcmParams) -> Result<Self> {
        params.validate()?;
        let mut buffer = vec![0; params.buffer_frames() * params.frame_bytes()];
        params.format.fill_silence(&mut buffer);
        Ok(Self {
            direction,
            params,
            ring: Mutex::new(Ring {
                buffer,
                hw: 0,
                appl: 0,
                period_done: 0,
            }),
            on_period: None,
            periods_elapsed: AtomicU64::new(0),
        })
    }

    /// A stream the application writes and the device plays
    pub fn playback(params: PcmParams) -> Result<Self> {
        Self::new(UsbDirection::Out, params)
    }

    /// A stream the device records and the application reads
    pub fn capture(params: PcmParams) -> Result<Self> {
        Self::new(UsbDirection::In, params)
    }

    /// Call `func` on every period boundary
    ///
    /// The callback runs in transfer completion context.
    pub fn on_period_elapsed(mut self, func: impl Fn(&Substream) + Send + Sync + 'static) -> Self {
        self.on_period = Some(Box::new(func));
        self
    }

    /// `Out` for playback, `In` for capture
    pub fn direction(&self) -> UsbDirection {
        self.direction
    }

    pub fn params(&self) -> &PcmParams {
        &self.params
    }

    pub fn hw_pointer(&self) -> u64 {
        self.ring.lock().hw
    }

    pub fn appl_pointer(&self) -> u64 {
        self.ring.lock().appl
    }

    /// Frames the application can move now: free space for playback,
    /// recorded frames for capture
    pub fn avail(&self) -> usize {
        let ring = self.ring.lock();
        let queued = (ring.appl.abs_diff(ring.hw)) as usize;
        match self.direction {
            UsbDirection::Out => self.params.buffer_frames() - queued,
            UsbDirection::In => queued,
        }
    }

    /// Period boundaries crossed so far
    pub fn periods_elapsed(&self) -> u64 {
        self.periods_elapsed.load(Ordering::Acquire)
    }

    /// Queue whole frames of `data` for playback, returning the bytes taken
    pub fn write(&self, data: &[u8]) -> usize {
        if self.direction != UsbDirection::Out {
            return 0;
        }
        let frame_bytes = self.params.frame_bytes();
        let mut ring = self.ring.lock();
        let queued = (ring.appl - ring.hw) as usize;
        let frames = (data.len() / frame_bytes).min(self.params.buffer_frames() - queued);
        let at = ring.appl;
        self.copy_in(&mut ring.buffer, at, &data[..frames * frame_bytes]);
        ring.appl += frames as u64;
        frames * frame_bytes
    }

    /// Take recorded whole frames into `data`, returning the bytes copied
    pub fn read(&self, data: &mut [u8]) -> usize {
        if self.direction != UsbDirection::In {
            return 0;
        }
        let frame_bytes = self.params.frame_bytes();
        let mut ring = self.ring.lock();
        let frames = (data.len() / frame_bytes).min((ring.hw - ring.appl) as usize);
        let at = ring.appl;
        self.copy_out(&ring.buffer, at, &mut data[..frames * frame_bytes]);
        ring.appl += frames as u64;
        frames * frame_bytes
    }

    /// Ring byte offset of frame pointer `at`
    fn offset(&self, at: u64) -> usize {
        (at % self.params.buffer_frames() as u64) as usize * self.params.frame_bytes()
    }

    /// Copy `src` into the ring at frame `at`, wrapping at the end
    fn copy_in(&self, buffer: &mut [u8], at: u64, src: &[u8]) {
        let start = self.offset(at);
        let first = src.len().min(buffer.len() - start);
        buffer[start..start + first].copy_from_slice(&src[..first]);
        buffer[..src.len() - first].copy_from_slice(&src[first..]);
    }

    /// Copy from the ring at frame `at` into `dst`, wrapping at the end
    fn copy_out(&self, buffer: &[u8], at: u64, dst: &mut [u8]) {
        let start = self.offset(at);
        let first = dst.len().min(buffer.len() - start);
        let len = dst.len();
        dst[..first].copy_from_slice(&buffer[start..start + first]);
        dst[first..].copy_from_slice(&buffer[..len - first]);
    }

    /// Fill `dst` with queued playback frames, then silence
    ///
    /// Returns the number of queued frames used. An underrun never stops
    /// the stream; the device hears silence until the application catches
    /// up.
    pub(crate) fn pull(&self, dst: &mut [u8]) -> usize {
        let frame_bytes = self.params.frame_bytes();
        let frames = {
            let mut ring = self.ring.lock();
            let queued = (ring.appl - ring.hw) as usize;
            let frames = (dst.len() / frame_bytes).min(queued);
            let at = ring.hw;
            self.copy_out(&ring.buffer, at, &mut dst[..frames * frame_bytes]);
            ring.hw += frames as u64;
            frames
        };
        if frames * frame_bytes < dst.len() {
            trace!("PCM underrun: {} of {} bytes", frames * frame_bytes, dst.len());
            self.params.format.fill_silence(&mut dst[frames * frame_bytes..]);
        }
        self.period_account(frames);
        frames
    }

    /// Append recorded frames from `src`
    ///
    /// Returns the number of frames kept; frames that don't fit are
    /// dropped.
    pub(crate) fn push(&self, src: &[u8]) -> usize {
        let frame_bytes = self.params.frame_bytes();
        let frames = {
            let mut ring = self.ring.lock();
            let free = self.params.buffer_frames() - (ring.hw - ring.appl) as usize;
            let frames = (src.len() / frame_bytes).min(free);
            let at = ring.hw;
            self.copy_in(&mut ring.buffer, at, &src[..frames * frame_bytes]);
            ring.hw += frames as u64;
            frames
        };
        if frames < src.len() / frame_bytes {
            warn!("PCM overrun: {} frames dropped", src.len() / frame_bytes - frames);
        }
        self.period_account(frames);
        frames
    }

    /// Count `frames` against the period, notifying on each boundary
    fn period_account(&self, frames: usize) {
        let period = self.params.period_frames();
        let crossed = {
            let mut ring = self.ring.lock();
            ring.period_done += frames;
            let crossed = ring.period_done / period;
            ring.period_done %= period;
            crossed
        };
        for _ in 0..crossed {
            self.periods_elapsed.fetch_add(1, Ordering::AcqRel);
            if let Some(callback) = &self.on_period {
                callback(self);
            }
        }
    }
}
