//! USB Audio Class streaming on the host
//!
//! An audio streaming interface advertises its format in class specific
//! descriptors of each alternate setting. [`FormatTypeI::find()`] reads
//! them back; [`PcmParams`] picks one format, rate and buffer geometry; a
//! [`Substream`] holds the PCM ring the application reads or writes; a
//! [`UacEndpoint`] keeps isochronous transfers moving between the ring and
//! the device.
//!
//! ```no_run
//! # use usbstack::host::{HostDevice, uac::*};
//! # use std::sync::Arc;
//! # fn f(device: HostDevice) -> usbstack::Result<()> {
//! device.set_interface(2, 1)?;
//! let params = PcmParams {
//!     format: PcmFormat::S16Le,
//!     channels: 2,
//!     rate: 48_000,
//!     period_bytes: 192 * 4,
//!     periods: 4,
//! };
//! set_sample_rate(&device, 0x04, params.rate)?;
//! let substream = Arc::new(Substream::playback(params)?);
//! let endpoint = UacEndpoint::new(device.pipe_open(0x04)?, substream.clone(), Default::default())?;
//! substream.write(&[0; 192 * 4]);
//! endpoint.start()?;
//! # Ok(()) }
//! ```

mod endpoint;
mod pcm;

pub use endpoint::{EndpointOptions, UacEndpoint};
pub use pcm::{PcmFormat, PcmParams, Substream};

use super::{HostDevice, InterfaceAlt};
use crate::descriptor::{descriptor_type, DescriptorIter};
use crate::error::{Error, Result};
use crate::setup::SetupPacket;
use alloc::vec::Vec;
use usb_device::control::{Recipient, RequestType};
use usb_device::UsbDirection;

/// Audio interface class
pub const AUDIO_CLASS: u8 = 0x01;
/// Audio streaming interface subclass
pub const AUDIOSTREAMING: u8 = 0x02;

/// Class specific AS interface descriptor subtypes
pub mod as_subtype {
    pub const GENERAL: u8 = 0x01;
    pub const FORMAT_TYPE: u8 = 0x02;
}

pub const FORMAT_TYPE_I: u8 = 0x01;

const SET_CUR: u8 = 0x01;
const SAMPLING_FREQ_CONTROL: u16 = 0x0100;

/// Sample rates an alternate setting supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rates {
    Continuous { min: u32, max: u32 },
    Discrete(Vec<u32>),
}

impl Rates {
    pub fn contains(&self, rate: u32) -> bool {
        match self {
            Rates::Continuous { min, max } => (*min..=*max).contains(&rate),
            Rates::Discrete(rates) => rates.contains(&rate),
        }
    }
}

/// Type I format descriptor of an alternate setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatTypeI {
    pub channels: u8,
    /// Bytes per sample of one channel
    pub subframe_size: u8,
    /// Significant bits in each subframe
    pub bit_resolution: u8,
    pub rates: Rates,
}

fn le24(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], 0])
}

impl FormatTypeI {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8
            || usize::from(buf[0]) != buf.len()
            || buf[1] != descriptor_type::CS_INTERFACE
            || buf[2] != as_subtype::FORMAT_TYPE
            || buf[3] != FORMAT_TYPE_I
        {
            return Err(Error::BadF);
        }
        let count = usize::from(buf[7]);
        let table = &buf[8..];
        let rates = match count {
            0 if table.len() >= 6 => Rates::Continuous {
                min: le24(&table[0..3]),
                max: le24(&table[3..6]),
            },
            0 => return Err(Error::BadF),
            _ if table.len() >= count * 3 => {
                Rates::Discrete(table.chunks_exact(3).take(count).map(le24).collect())
            }
            _ => return Err(Error::BadF),
        };
        if buf[4] == 0 || buf[5] == 0 {
            return Err(Error::BadF);
        }
        Ok(Self {
            channels: buf[4],
            subframe_size: buf[5],
            bit_resolution: buf[6],
            rates,
        })
    }

    /// Find the Type I format of an audio streaming alternate setting
    ///
    /// Fails with [`Error::NoDev`] if the setting isn't audio streaming or
    /// carries no Type I format.
    pub fn find(alt: &InterfaceAlt) -> Result<Self> {
        let descriptor = &alt.descriptor;
        if descriptor.interface_class != AUDIO_CLASS
            || descriptor.interface_subclass != AUDIOSTREAMING
        {
            return Err(Error::NoDev);
        }
        for raw in DescriptorIter::new(&alt.class_descriptors) {
            let raw = raw?;
            if raw.kind == descriptor_type::CS_INTERFACE
                && raw.bytes.get(2) == Some(&as_subtype::FORMAT_TYPE)
                && raw.bytes.get(3) == Some(&FORMAT_TYPE_I)
            {
                return Self::parse(raw.bytes);
            }
        }
        Err(Error::NoDev)
    }

    /// The PCM format matching the subframe layout
    pub fn pcm_format(&self) -> Option<PcmFormat> {
        PcmFormat::from_subframe(self.subframe_size, self.bit_resolution)
    }
}

/// Set the sampling frequency of isochronous endpoint `endpoint`
pub fn set_sample_rate(device: &HostDevice, endpoint: u8, rate: u32) -> Result<()> {
    if rate == 0 || rate > 0xFF_FFFF {
        return Err(Error::Inval);
    }
    let setup = SetupPacket::new(
        UsbDirection::Out,
        RequestType::Class,
        Recipient::Endpoint,
        SET_CUR,
        SAMPLING_FREQ_CONTROL,
        u16::from(endpoint),
        3,
    );
    let timeout = device.control_timeout()?;
    device.control_out(&setup, &rate.to_le_bytes()[..3], timeout)?;
    debug!("dev {} EP {:x} rate {}", device.address(), endpoint, rate);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{set_sample_rate, FormatTypeI, PcmFormat, Rates};
    use crate::testing;
    use crate::Error;
    use alloc::vec;

    #[test]
    fn formats_of_the_streaming_settings() {
        let fixture = testing::host();
        let device = fixture.attach();
        let config = device.config();

        let capture = FormatTypeI::find(config.interface(1).unwrap().alt(1).unwrap()).unwrap();
        assert_eq!(capture.channels, 2);
        assert_eq!(capture.bit_resolution, 16);
        assert_eq!(capture.rates, Rates::Discrete(vec![44_100]));
        assert_eq!(capture.pcm_format(), Some(PcmFormat::S16Le));

        let playback = FormatTypeI::find(config.interface(2).unwrap().alt(1).unwrap()).unwrap();
        assert!(playback.rates.contains(48_000));
        assert!(!playback.rates.contains(44_100));

        // Zero bandwidth setting and the vendor interface
        let idle = config.interface(1).unwrap().alt(0).unwrap();
        assert_eq!(FormatTypeI::find(idle), Err(Error::NoDev));
        let vendor = config.interface(0).unwrap().alt(0).unwrap();
        assert_eq!(FormatTypeI::find(vendor), Err(Error::NoDev));
    }

    #[test]
    fn continuous_rates() {
        let desc = [14, 0x24, 0x02, 0x01, 1, 3, 24, 0, 0x40, 0x1F, 0x00, 0x00, 0xEE, 0x02];
        let format = FormatTypeI::parse(&desc).unwrap();
        assert_eq!(format.rates, Rates::Continuous { min: 8_000, max: 192_000 });
        assert_eq!(format.pcm_format(), Some(PcmFormat::S24_3Le));
        assert_eq!(FormatTypeI::parse(&desc[..10]), Err(Error::BadF));
    }

    #[test]
    fn sample_rate_request() {
        let fixture = testing::host();
        let device = fixture.attach();
        set_sample_rate(&device, 0x04, 48_000).unwrap();
        let setup = fixture.driver.last_setup(device.address()).unwrap();
        assert_eq!(setup.request_type, 0x22);
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.index, 0x04);
        assert_eq!(setup.length, 3);
        assert_eq!(set_sample_rate(&device, 0x04, 0), Err(Error::Inval));
    }
}
